use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Edit,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "Create",
            ChangeType::Edit => "Edit",
            ChangeType::Delete => "Delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Create" => Some(ChangeType::Create),
            "Edit" => Some(ChangeType::Edit),
            "Delete" => Some(ChangeType::Delete),
            _ => None,
        }
    }
}

/// An audit-trail node attached to the owning study's trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAction {
    pub id: Id,
    pub parent_uid: Id,
    pub change_type: ChangeType,
    pub author_id: String,
    pub date: DateTime<Utc>,
}

/// A selection as it stood at one position of the collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionSnapshot<S> {
    /// 1-based position in the collection.
    pub order: usize,
    pub selection: S,
}

/// An audit action together with its `before` and `after` links.
///
/// `before` is absent for `Create`, `after` is absent for `Delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord<S> {
    pub action: AuditAction,
    pub selection_uid: Id,
    pub before: Option<SelectionSnapshot<S>>,
    pub after: Option<SelectionSnapshot<S>>,
}

impl<S> AuditRecord<S> {
    /// The snapshot this record describes: the new state, or the removed one.
    pub fn snapshot(&self) -> Option<&SelectionSnapshot<S>> {
        self.after.as_ref().or(self.before.as_ref())
    }
}

/// One row of a selection's history as shown to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionHistoryEntry<S> {
    pub study_selection_uid: Id,
    pub change_type: ChangeType,
    pub author_id: String,
    pub start_date: DateTime<Utc>,
    /// Date of the next action on the same selection, if any.
    pub end_date: Option<DateTime<Utc>>,
    pub order: usize,
    pub selection: S,
}
