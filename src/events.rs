//! Broadcast bus carrying admin refresh requests to the calculation worker

use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

use crate::models::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Matrix,
    Pattern,
    Trend,
}

impl RefreshKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshKind::Matrix => "matrix",
            RefreshKind::Pattern => "pattern",
            RefreshKind::Trend => "trend",
        }
    }
}

impl fmt::Display for RefreshKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown refresh kind '{0}'")]
pub struct ParseRefreshKindError(pub String);

impl FromStr for RefreshKind {
    type Err = ParseRefreshKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matrix" => Ok(RefreshKind::Matrix),
            "pattern" => Ok(RefreshKind::Pattern),
            "trend" => Ok(RefreshKind::Trend),
            other => Err(ParseRefreshKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshRequest {
    pub kind: RefreshKind,
    pub server: Server,
}

#[derive(Clone)]
pub struct RefreshBus {
    sender: broadcast::Sender<RefreshRequest>,
}

impl RefreshBus {
    pub fn new(sender: broadcast::Sender<RefreshRequest>) -> Self {
        Self { sender }
    }

    /// Returns false when no worker is listening.
    pub fn publish(&self, request: RefreshRequest) -> bool {
        self.sender.send(request).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RefreshRequest> {
        self.sender.subscribe()
    }
}
