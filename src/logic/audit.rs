use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};

use crate::model::{
    generate_id, AuditAction, AuditRecord, ChangeType, Id, Selection, SelectionHistoryEntry,
    SelectionSnapshot,
};

/// Everything one save writes for a selection aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionChangeSet<S> {
    pub parent_uid: Id,
    /// The full collection after the save, in order.
    pub selections: Vec<S>,
    /// Positions of the loaded collection that were replaced or dropped.
    pub removed: Vec<SelectionSnapshot<S>>,
    /// Positions of the new collection that differ from the loaded one.
    pub added: Vec<SelectionSnapshot<S>>,
    pub records: Vec<AuditRecord<S>>,
}

impl<S> SelectionChangeSet<S> {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Positional diff of the current collection against the loaded one.
///
/// Each position whose selection differs detaches the old snapshot and
/// attaches the new one. A uid present on both sides gets one `Edit`
/// action shared by its detached and attached snapshots; a uid only in the
/// loaded collection gets `Delete`, a uid only in the current one `Create`.
pub fn diff_selections<S: Selection>(
    parent_uid: &str,
    loaded: &[S],
    current: &[S],
    author_id: &str,
    now: DateTime<Utc>,
) -> SelectionChangeSet<S> {
    let current_uids: HashSet<&str> = current.iter().map(|s| s.study_selection_uid()).collect();
    let loaded_uids: HashSet<&str> = loaded.iter().map(|s| s.study_selection_uid()).collect();

    let mut removed = Vec::new();
    let mut added = Vec::new();
    for (index, selection) in current.iter().enumerate() {
        let previous = loaded.get(index);
        if previous == Some(selection) {
            continue;
        }
        if let Some(previous) = previous {
            removed.push(SelectionSnapshot {
                order: index + 1,
                selection: previous.clone(),
            });
        }
        added.push(SelectionSnapshot {
            order: index + 1,
            selection: selection.clone(),
        });
    }
    for (index, previous) in loaded.iter().enumerate().skip(current.len()) {
        removed.push(SelectionSnapshot {
            order: index + 1,
            selection: previous.clone(),
        });
    }

    let action_for = |uid: &str, selection: &S| -> AuditAction {
        let in_current = current_uids.contains(uid);
        let in_loaded = loaded_uids.contains(uid);
        let change_type = match (in_loaded, in_current) {
            (true, true) => ChangeType::Edit,
            (false, true) => ChangeType::Create,
            _ => ChangeType::Delete,
        };
        let (author, date) = match change_type {
            ChangeType::Create => (selection.author_id().to_string(), selection.start_date()),
            _ => (author_id.to_string(), now),
        };
        AuditAction {
            id: generate_id(),
            parent_uid: parent_uid.to_string(),
            change_type,
            author_id: author,
            date,
        }
    };

    // uid -> index into `records`, so a removal and an addition of the same
    // selection share one action node
    let mut by_uid: HashMap<String, usize> = HashMap::new();
    let mut records: Vec<AuditRecord<S>> = Vec::new();
    for snapshot in removed.iter() {
        let uid = snapshot.selection.study_selection_uid().to_string();
        let action = action_for(&uid, &snapshot.selection);
        by_uid.insert(uid.clone(), records.len());
        records.push(AuditRecord {
            action,
            selection_uid: uid,
            before: Some(snapshot.clone()),
            after: None,
        });
    }
    for snapshot in added.iter() {
        let uid = snapshot.selection.study_selection_uid().to_string();
        match by_uid.get(&uid) {
            Some(&index) => records[index].after = Some(snapshot.clone()),
            None => {
                let action = action_for(&uid, &snapshot.selection);
                by_uid.insert(uid.clone(), records.len());
                records.push(AuditRecord {
                    action,
                    selection_uid: uid,
                    before: None,
                    after: Some(snapshot.clone()),
                });
            }
        }
    }

    SelectionChangeSet {
        parent_uid: parent_uid.to_string(),
        selections: current.to_vec(),
        removed,
        added,
        records,
    }
}

/// Turns stored audit records into history rows, newest first.
///
/// The end date of each row is the date of the next action on the same
/// selection.
pub fn build_history<S: Selection>(
    records: &[AuditRecord<S>],
    study_selection_uid: Option<&str>,
) -> Vec<SelectionHistoryEntry<S>> {
    let mut per_selection: HashMap<&str, Vec<&AuditRecord<S>>> = HashMap::new();
    for record in records {
        if study_selection_uid.is_some_and(|uid| uid != record.selection_uid) {
            continue;
        }
        per_selection
            .entry(record.selection_uid.as_str())
            .or_default()
            .push(record);
    }

    let mut entries = Vec::new();
    for chain in per_selection.into_values() {
        let chain: Vec<_> = chain
            .into_iter()
            .sorted_by_key(|record| record.action.date)
            .collect();
        for (position, record) in chain.iter().enumerate() {
            let Some(snapshot) = record.snapshot() else {
                continue;
            };
            entries.push(SelectionHistoryEntry {
                study_selection_uid: record.selection_uid.clone(),
                change_type: record.action.change_type,
                author_id: record.action.author_id.clone(),
                start_date: record.action.date,
                end_date: chain.get(position + 1).map(|next| next.action.date),
                order: snapshot.order,
                selection: snapshot.selection.clone(),
            });
        }
    }
    entries.sort_by(|a, b| {
        b.start_date
            .cmp(&a.start_date)
            .then_with(|| a.study_selection_uid.cmp(&b.study_selection_uid))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StudySelectionObjectiveVO;
    use chrono::Duration;

    fn objective(uid: &str, objective_uid: &str) -> StudySelectionObjectiveVO {
        StudySelectionObjectiveVO {
            study_selection_uid: uid.to_string(),
            study_uid: Some("Study_000001".to_string()),
            objective_uid: Some(objective_uid.to_string()),
            objective_version: Some("1.0".to_string()),
            objective_level_uid: None,
            objective_level_order: None,
            start_date: Utc::now() - Duration::hours(1),
            author_id: "creator".to_string(),
            accepted_version: false,
        }
    }

    fn kinds<S>(changes: &SelectionChangeSet<S>) -> Vec<(String, ChangeType)> {
        changes
            .records
            .iter()
            .map(|r| (r.selection_uid.clone(), r.action.change_type))
            .sorted()
            .collect()
    }

    #[test]
    fn test_unchanged_collection_records_nothing() {
        let loaded = vec![objective("A", "O1"), objective("B", "O2")];
        let changes = diff_selections("Study_000001", &loaded, &loaded, "saver", Utc::now());
        assert!(changes.is_empty());
        assert!(changes.records.is_empty());
    }

    #[test]
    fn test_append_is_create_with_selection_author() {
        let loaded = vec![objective("A", "O1")];
        let added = objective("B", "O2");
        let current = vec![loaded[0].clone(), added.clone()];

        let changes = diff_selections("Study_000001", &loaded, &current, "saver", Utc::now());
        assert_eq!(changes.records.len(), 1);
        let record = &changes.records[0];
        assert_eq!(record.action.change_type, ChangeType::Create);
        assert_eq!(record.action.author_id, "creator");
        assert_eq!(record.action.date, added.start_date);
        assert!(record.before.is_none());
        assert_eq!(record.after.as_ref().unwrap().order, 2);
    }

    #[test]
    fn test_in_place_edit_links_before_and_after() {
        let loaded = vec![objective("A", "O1")];
        let current = vec![loaded[0].update_objective_version("2.0")];
        let now = Utc::now();

        let changes = diff_selections("Study_000001", &loaded, &current, "saver", now);
        assert_eq!(changes.records.len(), 1);
        let record = &changes.records[0];
        assert_eq!(record.action.change_type, ChangeType::Edit);
        assert_eq!(record.action.author_id, "saver");
        assert_eq!(record.action.date, now);
        assert_eq!(record.before.as_ref().unwrap().selection, loaded[0]);
        assert_eq!(record.after.as_ref().unwrap().selection, current[0]);
    }

    #[test]
    fn test_removal_of_head_edits_shifted_and_deletes_removed() {
        let loaded = vec![objective("A", "O1"), objective("B", "O2"), objective("C", "O3")];
        let current = vec![loaded[1].clone(), loaded[2].clone()];

        let changes = diff_selections("Study_000001", &loaded, &current, "saver", Utc::now());
        assert_eq!(changes.removed.len(), 3);
        assert_eq!(changes.added.len(), 2);
        assert_eq!(
            kinds(&changes),
            vec![
                ("A".to_string(), ChangeType::Delete),
                ("B".to_string(), ChangeType::Edit),
                ("C".to_string(), ChangeType::Edit),
            ]
        );
        let delete = changes
            .records
            .iter()
            .find(|r| r.selection_uid == "A")
            .unwrap();
        assert!(delete.after.is_none());
        assert_eq!(delete.before.as_ref().unwrap().order, 1);

        let b = changes
            .records
            .iter()
            .find(|r| r.selection_uid == "B")
            .unwrap();
        assert_eq!(b.before.as_ref().unwrap().order, 2);
        assert_eq!(b.after.as_ref().unwrap().order, 1);
    }

    #[test]
    fn test_swap_yields_two_edits() {
        let loaded = vec![objective("A", "O1"), objective("B", "O2")];
        let current = vec![loaded[1].clone(), loaded[0].clone()];

        let changes = diff_selections("Study_000001", &loaded, &current, "saver", Utc::now());
        assert_eq!(
            kinds(&changes),
            vec![
                ("A".to_string(), ChangeType::Edit),
                ("B".to_string(), ChangeType::Edit),
            ]
        );
        assert!(changes
            .records
            .iter()
            .all(|r| r.before.is_some() && r.after.is_some()));
    }

    #[test]
    fn test_history_chains_end_dates_newest_first() {
        let t0 = Utc::now() - Duration::hours(3);
        let first = objective("A", "O1");
        let mut created = diff_selections("Study_000001", &[], &[first.clone()], "saver", t0);
        for record in created.records.iter_mut() {
            record.action.date = t0;
        }
        let edited = first.update_objective_version("2.0");
        let edit = diff_selections(
            "Study_000001",
            &[first.clone()],
            &[edited.clone()],
            "saver",
            t0 + Duration::hours(1),
        );
        let delete = diff_selections(
            "Study_000001",
            &[edited.clone()],
            &[],
            "saver",
            t0 + Duration::hours(2),
        );
        let other = diff_selections("Study_000001", &[], &[objective("B", "O2")], "saver", t0);

        let records: Vec<_> = created
            .records
            .into_iter()
            .chain(edit.records)
            .chain(delete.records)
            .chain(other.records)
            .collect();

        let history = build_history(&records, Some("A"));
        let types: Vec<_> = history.iter().map(|h| h.change_type).collect();
        assert_eq!(
            types,
            vec![ChangeType::Delete, ChangeType::Edit, ChangeType::Create]
        );
        assert_eq!(history[0].end_date, None);
        assert_eq!(history[1].end_date, Some(t0 + Duration::hours(2)));
        assert_eq!(history[2].end_date, Some(t0 + Duration::hours(1)));
        assert_eq!(history[1].selection, edited);

        let all = build_history(&records, None);
        assert_eq!(all.len(), 4);
    }
}
