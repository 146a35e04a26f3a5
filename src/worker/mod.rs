//! Calculation worker
//!
//! Recomputes the persisted daily drop matrix and pattern matrix of every
//! server on a fixed cycle, warms the global trend, and serves refresh
//! requests published on the [`RefreshBus`](crate::events::RefreshBus).

mod collector;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::events::{RefreshKind, RefreshRequest};
use crate::models::{DropMatrixElement, Server, SourceCategory};
use crate::service::StatsService;

use collector::fan_in;

#[derive(Debug)]
struct MatrixJobReport {
    day_num: i32,
    elements: usize,
    repaired_yesterday: bool,
}

#[derive(Debug)]
struct JobOutcome {
    server: Server,
    source_category: SourceCategory,
    result: Result<MatrixJobReport>,
}

/// Persistence the daily drop matrix job runs against.
#[async_trait]
trait DailyMatrixStore: Send + Sync {
    async fn calc_day(
        &self,
        server: Server,
        source_category: SourceCategory,
        day_num: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DropMatrixElement>>;

    /// Replaces the stored day; true when it already had rows.
    async fn replace_day(
        &self,
        server: Server,
        source_category: SourceCategory,
        day_num: i32,
        elements: &[DropMatrixElement],
    ) -> Result<bool>;

    async fn invalidate(&self, server: Server, source_category: SourceCategory);
}

#[async_trait]
impl DailyMatrixStore for StatsService {
    async fn calc_day(
        &self,
        server: Server,
        source_category: SourceCategory,
        day_num: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DropMatrixElement>> {
        Ok(self.calc_drop_matrix_for_day(server, source_category, day_num, now).await?)
    }

    async fn replace_day(
        &self,
        server: Server,
        source_category: SourceCategory,
        day_num: i32,
        elements: &[DropMatrixElement],
    ) -> Result<bool> {
        Ok(self
            .db()
            .replace_drop_matrix_elements(server, day_num, source_category, elements)
            .await?)
    }

    async fn invalidate(&self, server: Server, source_category: SourceCategory) {
        self.caches().invalidate_server_results(server, source_category).await;
    }
}

pub struct Worker {
    service: Arc<StatsService>,
    config: WorkerConfig,
    source_categories: Vec<SourceCategory>,
}

impl Worker {
    pub fn new(service: Arc<StatsService>, config: WorkerConfig) -> Result<Self> {
        let source_categories = config.source_categories()?;
        Ok(Self {
            service,
            config,
            source_categories,
        })
    }

    /// Start the worker loop; it exits once `shutdown` flips to true.
    pub fn spawn(
        self,
        refresh: broadcast::Receiver<RefreshRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(refresh, shutdown))
    }

    async fn run(self, mut refresh: broadcast::Receiver<RefreshRequest>, mut shutdown: watch::Receiver<bool>) {
        let mut cycle = tokio::time::interval(self.config.interval());
        cycle.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let trend_period = self.config.trend_interval();
        let mut trend = tokio::time::interval_at(tokio::time::Instant::now() + trend_period, trend_period);
        trend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Calculation worker started (interval={:?}, concurrency={}, sources={:?})",
            self.config.interval(),
            self.config.concurrency,
            self.source_categories
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Calculation worker shutting down");
                        break;
                    }
                }
                _ = cycle.tick() => self.run_cycle(&Server::ALL).await,
                _ = trend.tick() => self.warm_trends(&Server::ALL).await,
                request = refresh.recv() => match request {
                    Ok(request) => self.handle_refresh(request).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Calculation worker skipped {} refresh requests", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Refresh bus closed, calculation worker stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_refresh(&self, request: RefreshRequest) {
        info!(server = %request.server, kind = %request.kind, "Refresh requested");
        let servers = [request.server];
        match request.kind {
            RefreshKind::Matrix => self.refresh_drop_matrices(&servers).await,
            RefreshKind::Pattern => self.refresh_pattern_matrices(&servers).await,
            RefreshKind::Trend => self.warm_trends(&servers).await,
        }
    }

    async fn run_cycle(&self, servers: &[Server]) {
        let started = Instant::now();
        self.refresh_drop_matrices(servers).await;
        tokio::time::sleep(self.config.separation()).await;
        self.refresh_pattern_matrices(servers).await;
        info!("Calculation cycle finished in {:?}", started.elapsed());
    }

    async fn refresh_drop_matrices(&self, servers: &[Server]) {
        let jobs = matrix_jobs(servers, &self.source_categories);
        let total = jobs.len();
        let service = self.service.clone();
        let timeout = self.config.timeout();

        let outcomes = fan_in(jobs, self.config.concurrency, self.config.separation(), move |(server, source_category)| {
            let service = service.clone();
            async move {
                let result = with_timeout(timeout, refresh_drop_matrix(service.as_ref(), server, source_category, Utc::now())).await;
                JobOutcome {
                    server,
                    source_category,
                    result,
                }
            }
        })
        .await;

        let failed = log_outcomes(&outcomes);
        if failed > 0 {
            warn!("{} of {} drop matrix jobs failed", failed, total);
        }
    }

    async fn refresh_pattern_matrices(&self, servers: &[Server]) {
        for &server in servers {
            match with_timeout(self.config.timeout(), async {
                self.service
                    .refresh_pattern_matrix(server)
                    .await
                    .context("pattern matrix refresh")
            })
            .await
            {
                Ok(count) => debug!(server = %server, "Persisted {} pattern matrix elements", count),
                Err(e) => error!(server = %server, "Pattern matrix refresh failed: {:#}", e),
            }
        }
    }

    async fn warm_trends(&self, servers: &[Server]) {
        let caches = self.service.caches();
        for &server in servers {
            let key = caches.shim_trend.key(&[server.as_str()]);
            if let Err(e) = caches.shim_trend.delete(&key).await {
                warn!(server = %server, "Failed to drop stale trend: {}", e);
            }
            match with_timeout(self.config.timeout(), async {
                self.service.get_shim_trend(server).await.context("trend warm-up")
            })
            .await
            {
                Ok(trend) => debug!(server = %server, "Trend warmed with {} stages", trend.value.trend.len()),
                Err(e) => error!(server = %server, "Trend warm-up failed: {:#}", e),
            }
        }
    }
}

fn matrix_jobs(servers: &[Server], source_categories: &[SourceCategory]) -> Vec<(Server, SourceCategory)> {
    servers
        .iter()
        .flat_map(|&server| source_categories.iter().map(move |&sc| (server, sc)))
        .collect()
}

async fn with_timeout<T>(limit: Duration, job: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, job).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {:?}", limit)),
    }
}

/// Recomputes today's elements. The first write of a new day also redoes
/// yesterday so its tail after the last cycle is not lost.
async fn refresh_drop_matrix<S: DailyMatrixStore + ?Sized>(
    store: &S,
    server: Server,
    source_category: SourceCategory,
    now: DateTime<Utc>,
) -> Result<MatrixJobReport> {
    let today = server.day_num(now);

    let elements = store
        .calc_day(server, source_category, today, now)
        .await
        .context("calculate today")?;
    let existed = store
        .replace_day(server, source_category, today, &elements)
        .await
        .context("persist today")?;

    let mut repaired_yesterday = false;
    if !existed {
        let yesterday = today - 1;
        let previous = store
            .calc_day(server, source_category, yesterday, now)
            .await
            .context("calculate yesterday")?;
        store
            .replace_day(server, source_category, yesterday, &previous)
            .await
            .context("persist yesterday")?;
        repaired_yesterday = true;
    }

    store.invalidate(server, source_category).await;

    Ok(MatrixJobReport {
        day_num: today,
        elements: elements.len(),
        repaired_yesterday,
    })
}

/// Logs each outcome and returns how many failed.
fn log_outcomes(outcomes: &[JobOutcome]) -> usize {
    let mut failed = 0;
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => info!(
                server = %outcome.server,
                source = %outcome.source_category,
                day = report.day_num,
                repaired_yesterday = report.repaired_yesterday,
                "Drop matrix updated with {} elements",
                report.elements
            ),
            Err(e) => {
                failed += 1;
                error!(
                    server = %outcome.server,
                    source = %outcome.source_category,
                    "Drop matrix job failed: {:#}",
                    e
                );
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RangeRef;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn jobs_cover_every_server_and_source() {
        let jobs = matrix_jobs(&Server::ALL, &[SourceCategory::All, SourceCategory::Manual]);
        assert_eq!(jobs.len(), 8);
        assert_eq!(jobs[0], (Server::CN, SourceCategory::All));
        assert_eq!(jobs[1], (Server::CN, SourceCategory::Manual));
        assert_eq!(jobs[7], (Server::KR, SourceCategory::Manual));
    }

    /// Reported clears per day and the rows persisted so far.
    #[derive(Default)]
    struct MemoryStore {
        reports: StdMutex<BTreeMap<i32, i64>>,
        stored: StdMutex<BTreeMap<i32, Vec<DropMatrixElement>>>,
        calculated: StdMutex<Vec<i32>>,
        invalidations: StdMutex<usize>,
    }

    impl MemoryStore {
        fn report(&self, day_num: i32, times: i64) {
            *self.reports.lock().unwrap().entry(day_num).or_default() += times;
        }

        fn stored_times(&self, day_num: i32) -> Option<i64> {
            self.stored
                .lock()
                .unwrap()
                .get(&day_num)
                .map(|rows| rows.iter().map(|el| el.times).sum())
        }
    }

    #[async_trait]
    impl DailyMatrixStore for MemoryStore {
        async fn calc_day(
            &self,
            server: Server,
            source_category: SourceCategory,
            day_num: i32,
            _now: DateTime<Utc>,
        ) -> Result<Vec<DropMatrixElement>> {
            self.calculated.lock().unwrap().push(day_num);
            let times = self.reports.lock().unwrap().get(&day_num).copied();
            let (start_time, end_time) = server.day_num_bounds(day_num);
            Ok(times
                .map(|times| DropMatrixElement {
                    server,
                    source_category,
                    stage_id: 1,
                    item_id: 10,
                    range: RangeRef::Stored(1),
                    quantity: times,
                    times,
                    quantity_buckets: BTreeMap::from([(1, times)]),
                    day_num,
                    start_time,
                    end_time,
                })
                .into_iter()
                .collect())
        }

        async fn replace_day(
            &self,
            _server: Server,
            _source_category: SourceCategory,
            day_num: i32,
            elements: &[DropMatrixElement],
        ) -> Result<bool> {
            let previous = self.stored.lock().unwrap().insert(day_num, elements.to_vec());
            Ok(previous.is_some_and(|rows| !rows.is_empty()))
        }

        async fn invalidate(&self, _server: Server, _source_category: SourceCategory) {
            *self.invalidations.lock().unwrap() += 1;
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn first_write_of_a_day_repairs_yesterday() {
        let store = MemoryStore::default();
        let server = Server::CN;
        // 12:00 UTC is 20:00 in Shanghai, well inside one game day.
        let today = server.day_num(at(10, 12));
        store.report(today, 3);

        let report = refresh_drop_matrix(&store, server, SourceCategory::All, at(10, 12)).await.unwrap();
        assert!(report.repaired_yesterday);
        assert_eq!(report.elements, 1);
        assert_eq!(store.stored_times(today), Some(3));

        // Later reports on the same day, then a cycle still inside it.
        store.report(today, 1);
        let report = refresh_drop_matrix(&store, server, SourceCategory::All, at(10, 13)).await.unwrap();
        assert!(!report.repaired_yesterday);
        assert_eq!(store.stored_times(today), Some(4));
        assert_eq!(*store.calculated.lock().unwrap(), vec![today, today - 1, today]);
        assert_eq!(*store.invalidations.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn late_reports_reach_yesterday_on_rollover() {
        let store = MemoryStore::default();
        let server = Server::CN;
        let day = server.day_num(at(10, 12));
        store.report(day, 5);
        refresh_drop_matrix(&store, server, SourceCategory::All, at(10, 12)).await.unwrap();
        assert_eq!(store.stored_times(day), Some(5));

        // Tail of the day that arrived after its last cycle.
        store.report(day, 2);
        store.report(day + 1, 1);
        let report = refresh_drop_matrix(&store, server, SourceCategory::All, at(11, 12)).await.unwrap();
        assert_eq!(report.day_num, day + 1);
        assert!(report.repaired_yesterday);
        assert_eq!(store.stored_times(day), Some(7));

        let before = store.stored.lock().unwrap().clone();
        let report = refresh_drop_matrix(&store, server, SourceCategory::All, at(11, 12)).await.unwrap();
        assert!(!report.repaired_yesterday);
        assert_eq!(*store.stored.lock().unwrap(), before);
    }

    #[test]
    fn failures_are_counted() {
        let outcomes = vec![
            JobOutcome {
                server: Server::CN,
                source_category: SourceCategory::All,
                result: Ok(MatrixJobReport {
                    day_num: 100,
                    elements: 3,
                    repaired_yesterday: false,
                }),
            },
            JobOutcome {
                server: Server::US,
                source_category: SourceCategory::All,
                result: Err(anyhow!("boom")),
            },
        ];
        assert_eq!(log_outcomes(&outcomes), 1);
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let result: Result<()> = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let service = Arc::new(crate::service::test_support::service());
        let mut config = WorkerConfig::default();
        config.interval_secs = 3600;
        let worker = Worker::new(service, config).unwrap();

        let (refresh_tx, refresh_rx) = broadcast::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Mark shutdown before the loop starts so the biased branch wins over the first tick.
        shutdown_tx.send(true).unwrap();
        let handle = worker.spawn(refresh_rx, shutdown_rx);
        drop(refresh_tx);

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
