use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MdrError, MdrResult};

pub const INITIAL_VERSION_LABEL: &str = "Initial version";
pub const NEW_VERSION_LABEL: &str = "New draft created";
pub const FINAL_VERSION_LABEL: &str = "Approved version";
pub const RETIRED_VERSION_LABEL: &str = "Inactivated version";
pub const REACTIVATED_VERSION_LABEL: &str = "Reactivated version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibraryItemStatus {
    Draft,
    Final,
    Retired,
}

impl LibraryItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryItemStatus::Draft => "Draft",
            LibraryItemStatus::Final => "Final",
            LibraryItemStatus::Retired => "Retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Draft" => Some(LibraryItemStatus::Draft),
            "Final" => Some(LibraryItemStatus::Final),
            "Retired" => Some(LibraryItemStatus::Retired),
            _ => None,
        }
    }
}

/// Actions that can change the status of a versioned item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectAction {
    Approve,
    Edit,
    Delete,
    NewVersion,
    Inactivate,
    Reactivate,
}

/// Library an item lives in, e.g. "Sponsor" or "CDISC"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryVO {
    pub name: String,
    pub is_editable: bool,
}

impl LibraryVO {
    pub fn new(name: impl Into<String>, is_editable: bool) -> Self {
        Self {
            name: name.into(),
            is_editable,
        }
    }
}

/// Status, version and authorship of one revision of a versioned item.
///
/// Instances are immutable: every transition returns a new value and leaves
/// `self` untouched, so a failed transition never leaves a half-applied state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub status: LibraryItemStatus,
    pub major_version: u32,
    pub minor_version: u32,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub author_id: String,
    pub change_description: String,
}

impl VersionMetadata {
    /// Metadata of a freshly created item: `0.1` Draft.
    pub fn initial(author_id: &str, start_date: Option<DateTime<Utc>>) -> Self {
        Self {
            status: LibraryItemStatus::Draft,
            major_version: 0,
            minor_version: 1,
            start_date: start_date.unwrap_or_else(Utc::now),
            end_date: None,
            author_id: author_id.to_string(),
            change_description: INITIAL_VERSION_LABEL.to_string(),
        }
    }

    /// Rebuilds metadata read back from storage; `0.0` is never a valid version.
    pub fn from_repository_values(
        status: LibraryItemStatus,
        major_version: u32,
        minor_version: u32,
        start_date: DateTime<Utc>,
        end_date: Option<DateTime<Utc>>,
        author_id: String,
        change_description: String,
    ) -> MdrResult<Self> {
        if major_version == 0 && minor_version == 0 {
            return Err(MdrError::validation("Version 0.0 is not a valid version."));
        }
        Ok(Self {
            status,
            major_version,
            minor_version,
            start_date,
            end_date,
            author_id,
            change_description,
        })
    }

    pub fn version(&self) -> String {
        format!("{}.{}", self.major_version, self.minor_version)
    }

    /// Parses a `"{major}.{minor}"` version string.
    pub fn parse_version(version: &str) -> Option<(u32, u32)> {
        let (major, minor) = version.split_once('.')?;
        Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
    }

    pub fn is_current(&self) -> bool {
        self.end_date.is_none()
    }

    fn next(
        &self,
        status: LibraryItemStatus,
        major_version: u32,
        minor_version: u32,
        author_id: &str,
        change_description: &str,
    ) -> Self {
        Self {
            status,
            major_version,
            minor_version,
            start_date: Utc::now(),
            end_date: None,
            author_id: author_id.to_string(),
            change_description: change_description.to_string(),
        }
    }

    /// Draft -> Draft with the minor version bumped.
    pub fn edited_draft(&self, author_id: &str, change_description: &str) -> MdrResult<Self> {
        if self.status != LibraryItemStatus::Draft {
            return Err(MdrError::versioning("The object is not in draft status."));
        }
        Ok(self.next(
            LibraryItemStatus::Draft,
            self.major_version,
            self.minor_version + 1,
            author_id,
            change_description,
        ))
    }

    /// Draft -> Final at the next major version.
    pub fn approved(&self, author_id: &str, change_description: &str) -> MdrResult<Self> {
        if self.status != LibraryItemStatus::Draft {
            return Err(MdrError::versioning_with(
                "Only DRAFT version can be approved.",
                403,
                "invalid_status_non_draft",
            ));
        }
        Ok(self.next(
            LibraryItemStatus::Final,
            self.major_version + 1,
            0,
            author_id,
            change_description,
        ))
    }

    /// Final or Retired -> Draft at `major.1`.
    pub fn new_draft(&self, author_id: &str, change_description: &str) -> MdrResult<Self> {
        if self.status == LibraryItemStatus::Draft {
            return Err(MdrError::versioning_with(
                "New draft version can be created only for FINAL or RETIRED versions.",
                403,
                "invalid_status_non_final",
            ));
        }
        Ok(self.next(
            LibraryItemStatus::Draft,
            self.major_version,
            1,
            author_id,
            change_description,
        ))
    }

    /// Final -> Retired, version unchanged.
    pub fn retired(&self, author_id: &str, change_description: &str) -> MdrResult<Self> {
        if self.status != LibraryItemStatus::Final {
            return Err(MdrError::versioning("Only FINAL version can be inactivated."));
        }
        Ok(self.next(
            LibraryItemStatus::Retired,
            self.major_version,
            self.minor_version,
            author_id,
            change_description,
        ))
    }

    /// Retired -> Final, version unchanged.
    pub fn reactivated(&self, author_id: &str, change_description: &str) -> MdrResult<Self> {
        if self.status != LibraryItemStatus::Retired {
            return Err(MdrError::versioning("Only RETIRED version can be reactivated."));
        }
        Ok(self.next(
            LibraryItemStatus::Final,
            self.major_version,
            self.minor_version,
            author_id,
            change_description,
        ))
    }

    pub fn closed_at(&self, end_date: DateTime<Utc>) -> Self {
        Self {
            end_date: Some(end_date),
            ..self.clone()
        }
    }
}

/// One link of an entity revision chain: a value snapshot and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision<V> {
    pub metadata: VersionMetadata,
    pub value: V,
}
