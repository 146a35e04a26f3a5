//! Game servers and their local-time game-day calendar

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local hour at which a game day begins on every server.
pub const GAME_DAY_START_HOUR: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Server {
    CN,
    US,
    JP,
    KR,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown server '{0}'")]
pub struct ParseServerError(pub String);

impl Server {
    pub const ALL: [Server; 4] = [Server::CN, Server::US, Server::JP, Server::KR];

    pub fn as_str(&self) -> &'static str {
        match self {
            Server::CN => "CN",
            Server::US => "US",
            Server::JP => "JP",
            Server::KR => "KR",
        }
    }

    pub fn timezone(&self) -> Tz {
        match self {
            Server::CN => chrono_tz::Asia::Shanghai,
            Server::US => chrono_tz::America::New_York,
            Server::JP => chrono_tz::Asia::Tokyo,
            Server::KR => chrono_tz::Asia::Seoul,
        }
    }

    /// Local calendar date of the game day containing `t`.
    /// Instants before 04:00 local belong to the previous date.
    pub fn game_date(&self, t: DateTime<Utc>) -> NaiveDate {
        let local = t.with_timezone(&self.timezone());
        let date = local.date_naive();
        if local.hour() < GAME_DAY_START_HOUR {
            date.pred_opt().unwrap_or(date)
        } else {
            date
        }
    }

    /// Start (04:00 local) of the game day on `date`, as UTC.
    pub fn game_date_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let tz = self.timezone();
        let naive = date.and_time(NaiveTime::MIN) + Duration::hours(GAME_DAY_START_HOUR as i64);
        tz.from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive))
            .with_timezone(&Utc)
    }

    pub fn game_day_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.game_date_start(self.game_date(t))
    }

    /// Day number of the game day containing `t`: days since 1970-01-01 in server-local dates.
    pub fn day_num(&self, t: DateTime<Utc>) -> i32 {
        self.game_date(t)
            .signed_duration_since(epoch_date())
            .num_days() as i32
    }

    pub fn day_num_start(&self, day_num: i32) -> DateTime<Utc> {
        self.game_date_start(epoch_date() + Duration::days(day_num as i64))
    }

    /// Half-open `[start, end)` bounds of a game day.
    pub fn day_num_bounds(&self, day_num: i32) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.day_num_start(day_num), self.day_num_start(day_num + 1))
    }
}

fn epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Server {
    type Err = ParseServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CN" => Ok(Server::CN),
            "US" => Ok(Server::US),
            "JP" => Ok(Server::JP),
            "KR" => Ok(Server::KR),
            other => Err(ParseServerError(other.to_string())),
        }
    }
}
