use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = String;

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}

/// Trims surrounding whitespace and maps empty strings to `None`.
pub fn normalize_string(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Formats a counter-based uid, e.g. `StudyEndpoint_000012`.
pub fn format_uid(prefix: &str, counter: u64) -> Id {
    format!("{}_{:06}", prefix, counter)
}

/// Extracts the numeric suffix of a counter-based uid.
pub fn uid_ordinal(uid: &str) -> Option<u64> {
    uid.rsplit('_').next().and_then(|tail| tail.parse().ok())
}

/// Lifecycle state of a study as far as selection edits are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentState {
    Draft,
    Released,
    Locked,
}

impl ParentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentState::Draft => "draft",
            ParentState::Released => "released",
            ParentState::Locked => "locked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(ParentState::Draft),
            "released" => Some(ParentState::Released),
            "locked" => Some(ParentState::Locked),
            _ => None,
        }
    }
}

impl Default for ParentState {
    fn default() -> Self {
        ParentState::Draft
    }
}

/// Pagination for reporting reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// 1-based page number.
    pub number: usize,
    /// 0 means "everything".
    pub size: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { number: 1, size: 0 }
    }
}

impl Page {
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        if self.size == 0 {
            return items;
        }
        match self.number.saturating_sub(1).checked_mul(self.size) {
            Some(skip) => items.into_iter().skip(skip).take(self.size).collect(),
            None => Vec::new(),
        }
    }
}
