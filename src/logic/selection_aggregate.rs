use crate::error::{MdrError, MdrResult};
use crate::model::{Id, Selection, SelectionChecks, StudySelectionEndpointVO};
use crate::store::session::{ClosureCarrier, RepositoryClosureData};
use crate::store::traits::LockToken;

/// What the repository remembers about a selection aggregate loaded for update.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionClosure<S> {
    /// The collection exactly as it was read from storage.
    pub loaded: Vec<S>,
    pub lock: LockToken,
}

/// Ordered collection of selections owned by one parent (a study).
///
/// The collection is always sorted by the selections' grouping key; the
/// relative order inside a group is whatever the user arranged with
/// [`SelectionAggregate::set_new_order`].
#[derive(Debug, Clone)]
pub struct SelectionAggregate<S: Selection> {
    parent_uid: Id,
    selections: Vec<S>,
    closure: Option<RepositoryClosureData<SelectionClosure<S>>>,
}

impl<S: Selection> SelectionAggregate<S> {
    pub fn new(parent_uid: impl Into<Id>) -> Self {
        Self {
            parent_uid: parent_uid.into(),
            selections: Vec::new(),
            closure: None,
        }
    }

    /// Rebuilds an aggregate from storage, keeping the stored order.
    pub fn from_repository_values(parent_uid: impl Into<Id>, selections: Vec<S>) -> Self {
        Self {
            parent_uid: parent_uid.into(),
            selections,
            closure: None,
        }
    }

    pub fn parent_uid(&self) -> &str {
        &self.parent_uid
    }

    pub fn selections(&self) -> &[S] {
        &self.selections
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    fn position_of(&self, study_selection_uid: &str) -> MdrResult<usize> {
        self.selections
            .iter()
            .position(|s| s.study_selection_uid() == study_selection_uid)
            .ok_or_else(|| {
                MdrError::not_found(format!(
                    "There is no selection between the {} '{}' and the study '{}'.",
                    S::DISPLAY_NAME,
                    study_selection_uid,
                    self.parent_uid
                ))
            })
    }

    /// Returns the selection and its 1-based order.
    pub fn get_specific_selection(&self, study_selection_uid: &str) -> MdrResult<(&S, usize)> {
        let index = self.position_of(study_selection_uid)?;
        Ok((&self.selections[index], index + 1))
    }

    /// Stable sort by grouping key, missing ordinals last.
    fn sort_by_grouping(&mut self) {
        self.selections.sort_by_key(|s| s.grouping().sort_key());
    }

    pub fn add_selection(&mut self, selection: S, checks: &dyn SelectionChecks) -> MdrResult<()> {
        selection.validate(checks)?;
        self.selections.push(selection);
        self.sort_by_grouping();
        Ok(())
    }

    pub fn remove_selection(&mut self, study_selection_uid: &str) -> MdrResult<S> {
        let index = self.position_of(study_selection_uid)?;
        Ok(self.selections.remove(index))
    }

    /// Moves a selection to `new_order` (1-based, clamped into range).
    ///
    /// The target slot must hold a selection of the same group, otherwise the
    /// move is rejected and the collection is left untouched.
    pub fn set_new_order(&mut self, study_selection_uid: &str, new_order: i64) -> MdrResult<()> {
        let len = self.selections.len() as i64;
        let new_order = new_order.clamp(1, len.max(1)) as usize;
        let old_index = self.position_of(study_selection_uid)?;
        let old_order = old_index + 1;
        let moved = &self.selections[old_index];
        let moved_uid = moved.study_selection_uid();

        let mut reordered: Vec<S> = Vec::with_capacity(self.selections.len());
        for (index, selection) in self.selections.iter().enumerate() {
            let is_moved = selection.study_selection_uid() == moved_uid;
            if index + 1 == new_order {
                if selection.grouping() != moved.grouping() {
                    return Err(MdrError::validation(format!(
                        "Not allowed to move the selection to order ({})",
                        new_order
                    )));
                }
                if old_order >= new_order {
                    reordered.push(moved.clone());
                    if !is_moved {
                        reordered.push(selection.clone());
                    }
                } else {
                    if !is_moved {
                        reordered.push(selection.clone());
                    }
                    reordered.push(moved.clone());
                }
            } else if !is_moved {
                reordered.push(selection.clone());
            }
        }
        self.selections = reordered;
        Ok(())
    }

    /// Replaces a selection with an updated value of the same uid.
    ///
    /// A changed grouping relocates the selection through remove and add.
    pub fn update_selection(&mut self, updated: S, checks: &dyn SelectionChecks) -> MdrResult<()> {
        let index = self.position_of(updated.study_selection_uid())?;
        if self.selections[index].grouping() != updated.grouping() {
            updated.validate(checks)?;
            self.selections.remove(index);
            self.selections.push(updated);
            self.sort_by_grouping();
        } else {
            updated.validate(checks)?;
            self.selections[index] = updated;
        }
        Ok(())
    }

    /// Fails with `AlreadyExists` on the first pair of selections sharing a
    /// uniqueness key.
    pub fn validate(&self) -> MdrResult<()> {
        let mut seen: Vec<S::UniqueKey> = Vec::with_capacity(self.selections.len());
        for selection in &self.selections {
            let key = selection.unique_key();
            if seen.contains(&key) {
                return Err(MdrError::already_exists(selection.duplicate_message()));
            }
            seen.push(key);
        }
        Ok(())
    }

    /// Applies a functional update to every selection, then restores the
    /// grouping order. Returns how many selections changed.
    pub fn rewrite_selections(&mut self, mut update: impl FnMut(&S) -> Option<S>) -> usize {
        let mut changed = 0;
        for selection in self.selections.iter_mut() {
            if let Some(updated) = update(selection) {
                if &updated != selection {
                    *selection = updated;
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.sort_by_grouping();
        }
        changed
    }
}

impl SelectionAggregate<StudySelectionEndpointVO> {
    /// Clears the objective link of every endpoint that pointed at a removed
    /// study objective.
    pub fn deleting_study_objective(&mut self, study_objective_uid: &str) -> usize {
        self.rewrite_selections(|endpoint| {
            (endpoint.study_objective_uid.as_deref() == Some(study_objective_uid))
                .then(|| endpoint.without_study_objective())
        })
    }
}

impl<S: Selection> ClosureCarrier for SelectionAggregate<S> {
    type Closure = SelectionClosure<S>;

    fn aggregate_uid(&self) -> Option<&str> {
        Some(&self.parent_uid)
    }

    fn closure_slot(&self) -> &Option<RepositoryClosureData<SelectionClosure<S>>> {
        &self.closure
    }

    fn closure_slot_mut(&mut self) -> &mut Option<RepositoryClosureData<SelectionClosure<S>>> {
        &mut self.closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AcceptAll, EndpointUnit, StudySelectionObjectiveVO};
    use chrono::Utc;

    fn endpoint(uid: &str, objective: Option<&str>, level: Option<u32>) -> StudySelectionEndpointVO {
        StudySelectionEndpointVO {
            study_selection_uid: uid.to_string(),
            study_uid: Some("Study_000001".to_string()),
            endpoint_uid: Some(format!("Endpoint_{}", uid)),
            endpoint_version: Some("1.0".to_string()),
            endpoint_level_uid: None,
            endpoint_sublevel_uid: None,
            study_objective_uid: objective.map(|s| s.to_string()),
            timeframe_uid: None,
            timeframe_version: None,
            endpoint_units: Vec::new(),
            unit_separator: None,
            endpoint_level_order: level,
            start_date: Utc::now(),
            author_id: "tester".to_string(),
            accepted_version: false,
        }
    }

    fn uids<S: Selection>(aggregate: &SelectionAggregate<S>) -> Vec<String> {
        aggregate
            .selections()
            .iter()
            .map(|s| s.study_selection_uid().to_string())
            .collect()
    }

    fn assert_grouping_sorted<S: Selection>(aggregate: &SelectionAggregate<S>) {
        let keys: Vec<_> = aggregate
            .selections()
            .iter()
            .map(|s| s.grouping().sort_key())
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_add_sorts_by_grouping_with_missing_last() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("E1", None, Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("E2", Some("StudyObjective_000002"), Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("E3", Some("StudyObjective_000001"), Some(2)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("E4", Some("StudyObjective_000001"), Some(1)), &AcceptAll)
            .unwrap();

        assert_eq!(uids(&aggregate), vec!["E4", "E3", "E2", "E1"]);
        assert_grouping_sorted(&aggregate);
    }

    #[test]
    fn test_add_rejects_invalid_selection_without_mutation() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        let mut invalid = endpoint("E1", None, None);
        invalid.endpoint_units = vec![
            EndpointUnit {
                uid: "Unit_000001".to_string(),
                name: None,
            },
            EndpointUnit {
                uid: "Unit_000002".to_string(),
                name: None,
            },
        ];
        let err = aggregate.add_selection(invalid, &AcceptAll).unwrap_err();
        assert!(matches!(err, MdrError::Validation(_)));
        assert!(err.to_string().contains("separator"));
        assert!(aggregate.is_empty());
    }

    #[test]
    fn test_get_specific_selection_reports_order() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("A", Some("StudyObjective_000001"), Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("B", Some("StudyObjective_000001"), Some(2)), &AcceptAll)
            .unwrap();

        let (selection, order) = aggregate.get_specific_selection("B").unwrap();
        assert_eq!(selection.study_selection_uid, "B");
        assert_eq!(order, 2);
        assert!(matches!(
            aggregate.get_specific_selection("missing"),
            Err(MdrError::NotFound(_))
        ));
    }

    #[test]
    fn test_reorder_across_groups_is_rejected_and_leaves_collection() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("A", Some("StudyObjective_000001"), Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("B", Some("StudyObjective_000001"), Some(2)), &AcceptAll)
            .unwrap();

        let err = aggregate.set_new_order("B", 1).unwrap_err();
        assert_eq!(err.to_string(), "Not allowed to move the selection to order (1)");
        assert!(matches!(err, MdrError::Validation(_)));
        assert_eq!(uids(&aggregate), vec!["A", "B"]);
    }

    #[test]
    fn test_reorder_within_group() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        for uid in ["A", "B", "C"] {
            aggregate
                .add_selection(endpoint(uid, Some("StudyObjective_000001"), Some(1)), &AcceptAll)
                .unwrap();
        }

        aggregate.set_new_order("B", 1).unwrap();
        assert_eq!(uids(&aggregate), vec!["B", "A", "C"]);

        aggregate.set_new_order("B", 3).unwrap();
        assert_eq!(uids(&aggregate), vec!["A", "C", "B"]);

        aggregate.set_new_order("B", 2).unwrap();
        assert_eq!(uids(&aggregate), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_reorder_clamps_out_of_range() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        for uid in ["A", "B", "C"] {
            aggregate
                .add_selection(endpoint(uid, Some("StudyObjective_000001"), Some(1)), &AcceptAll)
                .unwrap();
        }

        aggregate.set_new_order("A", 99).unwrap();
        assert_eq!(uids(&aggregate), vec!["B", "C", "A"]);

        aggregate.set_new_order("A", -5).unwrap();
        assert_eq!(uids(&aggregate), vec!["A", "B", "C"]);

        // moving onto itself is a no-op
        aggregate.set_new_order("B", 2).unwrap();
        assert_eq!(uids(&aggregate), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_update_in_place_keeps_position() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        for uid in ["A", "B"] {
            aggregate
                .add_selection(endpoint(uid, Some("StudyObjective_000001"), Some(1)), &AcceptAll)
                .unwrap();
        }
        aggregate.set_new_order("B", 1).unwrap();

        let (current, _) = aggregate.get_specific_selection("B").unwrap();
        let updated = current.update_endpoint_version("2.0");
        aggregate.update_selection(updated, &AcceptAll).unwrap();

        assert_eq!(uids(&aggregate), vec!["B", "A"]);
        assert_eq!(
            aggregate.selections()[0].endpoint_version.as_deref(),
            Some("2.0")
        );
    }

    #[test]
    fn test_update_with_new_group_relocates() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("A", Some("StudyObjective_000001"), Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("B", Some("StudyObjective_000002"), Some(1)), &AcceptAll)
            .unwrap();

        let mut moved = aggregate.get_specific_selection("A").unwrap().0.clone();
        moved.study_objective_uid = Some("StudyObjective_000003".to_string());
        aggregate.update_selection(moved, &AcceptAll).unwrap();

        assert_eq!(uids(&aggregate), vec!["B", "A"]);
        assert_grouping_sorted(&aggregate);
    }

    #[test]
    fn test_remove_selection() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("A", None, None), &AcceptAll)
            .unwrap();

        let removed = aggregate.remove_selection("A").unwrap();
        assert_eq!(removed.study_selection_uid, "A");
        assert!(aggregate.is_empty());
        assert!(matches!(
            aggregate.remove_selection("A"),
            Err(MdrError::NotFound(_))
        ));
    }

    #[test]
    fn test_validate_detects_duplicates() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        let first = endpoint("A", Some("StudyObjective_000001"), Some(1));
        let mut second = first.clone();
        second.study_selection_uid = "B".to_string();
        aggregate.add_selection(first, &AcceptAll).unwrap();
        aggregate.validate().unwrap();
        aggregate.add_selection(second, &AcceptAll).unwrap();

        assert!(matches!(
            aggregate.validate(),
            Err(MdrError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_deleting_study_objective_clears_links() {
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate
            .add_selection(endpoint("A", Some("StudyObjective_000001"), Some(1)), &AcceptAll)
            .unwrap();
        aggregate
            .add_selection(endpoint("B", Some("StudyObjective_000002"), Some(1)), &AcceptAll)
            .unwrap();

        let changed = aggregate.deleting_study_objective("StudyObjective_000001");
        assert_eq!(changed, 1);
        assert_eq!(uids(&aggregate), vec!["B", "A"]);
        assert!(aggregate.selections()[1].study_objective_uid.is_none());
    }

    #[test]
    fn test_objective_selections_group_by_level() {
        let objective = |uid: &str, level: Option<u32>| StudySelectionObjectiveVO {
            study_selection_uid: uid.to_string(),
            study_uid: None,
            objective_uid: Some(format!("Objective_{}", uid)),
            objective_version: None,
            objective_level_uid: None,
            objective_level_order: level,
            start_date: Utc::now(),
            author_id: "tester".to_string(),
            accepted_version: false,
        };
        let mut aggregate = SelectionAggregate::new("Study_000001");
        aggregate.add_selection(objective("X", None), &AcceptAll).unwrap();
        aggregate.add_selection(objective("Y", Some(2)), &AcceptAll).unwrap();
        aggregate.add_selection(objective("Z", Some(1)), &AcceptAll).unwrap();

        assert_eq!(uids(&aggregate), vec!["Z", "Y", "X"]);
        assert!(aggregate.set_new_order("X", 1).is_err());
    }
}
