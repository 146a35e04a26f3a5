//! Report origin categories

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `source_name` values sent by recognition clients.
pub const AUTOMATED_SOURCES: &[&str] = &["MeoAssistant", "MaaAssistantArknights", "frontend-v2-recognition"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceCategory {
    All,
    Automated,
    Manual,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown source category '{0}'")]
pub struct ParseSourceCategoryError(pub String);

impl SourceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCategory::All => "all",
            SourceCategory::Automated => "automated",
            SourceCategory::Manual => "manual",
        }
    }

    /// Whether the worker restricts this category to single-clear reports.
    pub fn exclude_non_one_times(&self) -> bool {
        matches!(self, SourceCategory::Automated)
    }
}

impl fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceCategory {
    type Err = ParseSourceCategoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(SourceCategory::All),
            "automated" => Ok(SourceCategory::Automated),
            "manual" => Ok(SourceCategory::Manual),
            other => Err(ParseSourceCategoryError(other.to_string())),
        }
    }
}
