use anyhow::Result;
use std::collections::HashSet;

use crate::model::{ReferenceKind, Selection, SelectionChecks};
use crate::store::traits::ReferenceLookup;

/// Existence predicates answered from references looked up ahead of time.
///
/// Selection validation is synchronous, so every reference a selection will
/// be asked about is resolved against storage first.
#[derive(Debug, Clone, Default)]
pub struct ResolvedChecks {
    known: HashSet<(ReferenceKind, String)>,
}

impl ResolvedChecks {
    pub async fn resolve<L: ReferenceLookup + ?Sized>(
        lookup: &L,
        references: &[(ReferenceKind, String)],
    ) -> Result<Self> {
        let mut known = HashSet::new();
        for (kind, uid) in references {
            if known.contains(&(*kind, uid.clone())) {
                continue;
            }
            if lookup.reference_exists(*kind, uid).await? {
                known.insert((*kind, uid.clone()));
            }
        }
        Ok(Self { known })
    }

    pub async fn for_selection<L: ReferenceLookup + ?Sized, S: Selection>(
        lookup: &L,
        selection: &S,
    ) -> Result<Self> {
        Self::resolve(lookup, &selection.references()).await
    }

    fn has(&self, kind: ReferenceKind, uid: &str) -> bool {
        self.known.contains(&(kind, uid.to_string()))
    }
}

impl SelectionChecks for ResolvedChecks {
    fn objective_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::Objective, uid)
    }

    fn endpoint_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::Endpoint, uid)
    }

    fn timeframe_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::Timeframe, uid)
    }

    fn study_objective_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::StudyObjective, uid)
    }

    fn ct_term_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::CtTerm, uid)
    }

    fn unit_definition_exists(&self, uid: &str) -> bool {
        self.has(ReferenceKind::UnitDefinition, uid)
    }
}
