use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MdrResult;

/// Kinds of cross-referenced items a selection may point to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Endpoint,
    Timeframe,
    Objective,
    StudyObjective,
    CtTerm,
    UnitDefinition,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Endpoint => "endpoint",
            ReferenceKind::Timeframe => "timeframe",
            ReferenceKind::Objective => "objective",
            ReferenceKind::StudyObjective => "study_objective",
            ReferenceKind::CtTerm => "ct_term",
            ReferenceKind::UnitDefinition => "unit_definition",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "endpoint" => Some(ReferenceKind::Endpoint),
            "timeframe" => Some(ReferenceKind::Timeframe),
            "objective" => Some(ReferenceKind::Objective),
            "study_objective" => Some(ReferenceKind::StudyObjective),
            "ct_term" => Some(ReferenceKind::CtTerm),
            "unit_definition" => Some(ReferenceKind::UnitDefinition),
            _ => None,
        }
    }
}

/// Existence predicates a selection is validated against.
///
/// Every predicate is explicit; there are no "always true" defaults. Tests use
/// [`AcceptAll`], services use a catalog resolved from storage.
pub trait SelectionChecks {
    /// An approved objective with this uid exists.
    fn objective_exists(&self, uid: &str) -> bool;
    /// An approved endpoint with this uid exists.
    fn endpoint_exists(&self, uid: &str) -> bool;
    /// An approved timeframe with this uid exists.
    fn timeframe_exists(&self, uid: &str) -> bool;
    /// The study has a current objective selection with this uid.
    fn study_objective_exists(&self, uid: &str) -> bool;
    fn ct_term_exists(&self, uid: &str) -> bool;
    fn unit_definition_exists(&self, uid: &str) -> bool;
}

/// Test double accepting every reference.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SelectionChecks for AcceptAll {
    fn objective_exists(&self, _uid: &str) -> bool {
        true
    }
    fn endpoint_exists(&self, _uid: &str) -> bool {
        true
    }
    fn timeframe_exists(&self, _uid: &str) -> bool {
        true
    }
    fn study_objective_exists(&self, _uid: &str) -> bool {
        true
    }
    fn ct_term_exists(&self, _uid: &str) -> bool {
        true
    }
    fn unit_definition_exists(&self, _uid: &str) -> bool {
        true
    }
}

/// Business grouping of a selection. Missing ordinals sort last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grouping {
    pub primary: Option<u64>,
    pub secondary: Option<u64>,
}

impl Grouping {
    pub fn new(primary: Option<u64>, secondary: Option<u64>) -> Self {
        Self { primary, secondary }
    }

    pub fn sort_key(&self) -> (u64, u64) {
        (
            self.primary.unwrap_or(u64::MAX),
            self.secondary.unwrap_or(u64::MAX),
        )
    }
}

/// A value object held by a selection aggregate.
pub trait Selection:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Storage discriminator and uid prefix, e.g. `StudyEndpoint`.
    const KIND: &'static str;
    /// Human readable name used in error messages.
    const DISPLAY_NAME: &'static str;

    type UniqueKey: PartialEq + fmt::Debug;

    fn study_selection_uid(&self) -> &str;
    fn author_id(&self) -> &str;
    fn start_date(&self) -> DateTime<Utc>;
    fn grouping(&self) -> Grouping;
    fn unique_key(&self) -> Self::UniqueKey;
    fn duplicate_message(&self) -> String;
    /// Every cross-reference the predicates will be asked about.
    fn references(&self) -> Vec<(ReferenceKind, String)>;
    fn validate(&self, checks: &dyn SelectionChecks) -> MdrResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ordinals_sort_last() {
        let grouped = Grouping::new(Some(1), Some(2));
        let no_secondary = Grouping::new(Some(1), None);
        let ungrouped = Grouping::new(None, Some(1));
        assert!(grouped.sort_key() < no_secondary.sort_key());
        assert!(no_secondary.sort_key() < ungrouped.sort_key());
    }

    #[test]
    fn test_reference_kind_round_trip_names() {
        for kind in [
            ReferenceKind::Endpoint,
            ReferenceKind::Timeframe,
            ReferenceKind::Objective,
            ReferenceKind::StudyObjective,
            ReferenceKind::CtTerm,
            ReferenceKind::UnitDefinition,
        ] {
            assert_eq!(ReferenceKind::parse(kind.as_str()), Some(kind));
        }
    }
}
