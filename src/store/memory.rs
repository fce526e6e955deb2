use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::error::LockConflict;
use crate::logic::audit::SelectionChangeSet;
use crate::model::{
    format_uid, AuditRecord, ConceptValue, Id, LibraryVO, Page, ParentState, ReferenceKind,
    Revision, StudySelectionEndpointVO, StudySelectionObjectiveVO,
};
use crate::store::traits::*;

#[derive(Debug)]
struct SelectionTable<S> {
    current: HashMap<Id, Vec<S>>,
    audit: HashMap<Id, Vec<AuditRecord<S>>>,
}

impl<S> SelectionTable<S> {
    fn write(&mut self, changes: SelectionChangeSet<S>) {
        self.current.insert(changes.parent_uid.clone(), changes.selections);
        self.audit
            .entry(changes.parent_uid)
            .or_default()
            .extend(changes.records);
    }
}

impl<S> Default for SelectionTable<S> {
    fn default() -> Self {
        Self {
            current: HashMap::new(),
            audit: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryItem {
    library: LibraryVO,
    revisions: Vec<Revision<ConceptValue>>,
    deleted: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    parents: HashMap<Id, ParentState>,
    lock_versions: HashMap<Id, i64>,
    endpoints: SelectionTable<StudySelectionEndpointVO>,
    objectives: SelectionTable<StudySelectionObjectiveVO>,
    items: HashMap<Id, MemoryItem>,
    libraries: HashMap<String, LibraryVO>,
    references: HashMap<(ReferenceKind, Id), Option<u32>>,
    counters: HashMap<String, u64>,
}

impl MemoryState {
    /// Checks the token against the root's lock version and bumps it.
    fn commit_lock(&mut self, lock: &LockToken) -> Result<()> {
        let current = self
            .lock_versions
            .get_mut(&lock.root_uid)
            .ok_or_else(|| anyhow!("Aggregate root '{}' not found", lock.root_uid))?;
        if *current != lock.version {
            return Err(LockConflict {
                parent_uid: lock.root_uid.clone(),
            }
            .into());
        }
        *current += 1;
        Ok(())
    }
}

/// Process-local gateway used by tests, the seed and `storage.backend = memory`
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AdvisoryLock for MemoryStore {
    async fn acquire_lock(&self, root_uid: &str) -> Result<LockToken> {
        let state = self.state.lock();
        let version = state
            .lock_versions
            .get(root_uid)
            .copied()
            .ok_or_else(|| anyhow!("Aggregate root '{}' not found", root_uid))?;
        Ok(LockToken {
            root_uid: root_uid.to_string(),
            version,
        })
    }
}

#[async_trait::async_trait]
impl ParentStore for MemoryStore {
    async fn parent_state(&self, parent_uid: &str) -> Result<Option<ParentState>> {
        Ok(self.state.lock().parents.get(parent_uid).copied())
    }

    async fn upsert_parent(&self, parent_uid: &str, parent_state: ParentState) -> Result<()> {
        let mut state = self.state.lock();
        state.parents.insert(parent_uid.to_string(), parent_state);
        state.lock_versions.entry(parent_uid.to_string()).or_insert(0);
        Ok(())
    }
}

macro_rules! memory_selection_store {
    ($selection:ty, $table:ident) => {
        #[async_trait::async_trait]
        impl SelectionStore<$selection> for MemoryStore {
            async fn load_selections(&self, parent_uid: &str) -> Result<Vec<$selection>> {
                let state = self.state.lock();
                Ok(state.$table.current.get(parent_uid).cloned().unwrap_or_default())
            }

            async fn list_selection_parents(&self, page: Page) -> Result<Vec<(Id, Vec<$selection>)>> {
                let state = self.state.lock();
                let mut parents: Vec<(Id, Vec<$selection>)> = state
                    .$table
                    .current
                    .iter()
                    .filter(|(_, selections)| !selections.is_empty())
                    .map(|(uid, selections)| (uid.clone(), selections.clone()))
                    .collect();
                parents.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(page.apply(parents))
            }

            async fn apply_selection_changes(
                &self,
                lock: &LockToken,
                changes: SelectionChangeSet<$selection>,
            ) -> Result<()> {
                let mut state = self.state.lock();
                state.commit_lock(lock)?;
                state.$table.write(changes);
                Ok(())
            }

            async fn load_audit_records(&self, parent_uid: &str) -> Result<Vec<AuditRecord<$selection>>> {
                let state = self.state.lock();
                Ok(state.$table.audit.get(parent_uid).cloned().unwrap_or_default())
            }
        }
    };
}

memory_selection_store!(StudySelectionEndpointVO, endpoints);
memory_selection_store!(StudySelectionObjectiveVO, objectives);

#[async_trait::async_trait]
impl StudySelectionBatch for MemoryStore {
    async fn apply_study_selection_batch(
        &self,
        objectives: PendingSelectionWrite<StudySelectionObjectiveVO>,
        endpoints: PendingSelectionWrite<StudySelectionEndpointVO>,
    ) -> Result<()> {
        objectives.lock.ensure_same_window(&endpoints.lock)?;
        let mut state = self.state.lock();
        state.commit_lock(&objectives.lock)?;
        state.objectives.write(objectives.changes);
        state.endpoints.write(endpoints.changes);
        Ok(())
    }
}

/// Closes each revision at the start of the next one.
fn chain_revisions(revisions: &mut [Revision<ConceptValue>]) {
    for index in 1..revisions.len() {
        let next_start = revisions[index].metadata.start_date;
        let previous = &mut revisions[index - 1].metadata;
        if previous.end_date.is_none() {
            previous.end_date = Some(next_start);
        }
    }
}

fn stored_item(uid: &str, item: &MemoryItem) -> Option<StoredItem<ConceptValue>> {
    let head = item.revisions.last()?;
    Some(StoredItem {
        uid: uid.to_string(),
        library: item.library.clone(),
        metadata: head.metadata.clone(),
        value: head.value.clone(),
        deleted: item.deleted,
    })
}

#[async_trait::async_trait]
impl LibraryItemStore<ConceptValue> for MemoryStore {
    async fn load_item(&self, uid: &str) -> Result<Option<StoredItem<ConceptValue>>> {
        let state = self.state.lock();
        Ok(state.items.get(uid).and_then(|item| stored_item(uid, item)))
    }

    async fn list_items(&self, library_name: Option<&str>, page: Page) -> Result<Vec<StoredItem<ConceptValue>>> {
        let state = self.state.lock();
        let mut items: Vec<StoredItem<ConceptValue>> = state
            .items
            .iter()
            .filter(|(_, item)| !item.deleted)
            .filter(|(_, item)| library_name.map_or(true, |name| item.library.name == name))
            .filter_map(|(uid, item)| stored_item(uid, item))
            .collect();
        items.sort_by(|a, b| a.uid.cmp(&b.uid));
        Ok(page.apply(items))
    }

    async fn create_item(&self, uid: &str, library: &LibraryVO, revisions: Vec<Revision<ConceptValue>>) -> Result<()> {
        let mut state = self.state.lock();
        if state.items.contains_key(uid) {
            return Err(anyhow!("Library item '{}' already exists", uid));
        }
        let mut revisions = revisions;
        chain_revisions(&mut revisions);
        state.items.insert(
            uid.to_string(),
            MemoryItem {
                library: library.clone(),
                revisions,
                deleted: false,
            },
        );
        state.lock_versions.insert(uid.to_string(), 0);
        Ok(())
    }

    async fn append_revisions(
        &self,
        lock: &LockToken,
        uid: &str,
        revisions: Vec<Revision<ConceptValue>>,
        deleted: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.items.contains_key(uid) {
            return Err(anyhow!("Library item '{}' not found", uid));
        }
        state.commit_lock(lock)?;
        let item = state
            .items
            .get_mut(uid)
            .ok_or_else(|| anyhow!("Library item '{}' not found", uid))?;
        item.revisions.extend(revisions);
        chain_revisions(&mut item.revisions);
        if deleted {
            if let Some(head) = item.revisions.last_mut() {
                head.metadata.end_date.get_or_insert_with(Utc::now);
            }
            item.deleted = true;
        }
        Ok(())
    }

    async fn load_revisions(&self, uid: &str) -> Result<Vec<Revision<ConceptValue>>> {
        let state = self.state.lock();
        Ok(state
            .items
            .get(uid)
            .filter(|item| !item.deleted)
            .map(|item| item.revisions.clone())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl LibraryStore for MemoryStore {
    async fn get_library(&self, name: &str) -> Result<Option<LibraryVO>> {
        Ok(self.state.lock().libraries.get(name).cloned())
    }

    async fn upsert_library(&self, library: LibraryVO) -> Result<()> {
        self.state
            .lock()
            .libraries
            .insert(library.name.clone(), library);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReferenceLookup for MemoryStore {
    async fn reference_exists(&self, kind: ReferenceKind, uid: &str) -> Result<bool> {
        let state = self.state.lock();
        if kind == ReferenceKind::StudyObjective {
            return Ok(state
                .objectives
                .current
                .values()
                .flatten()
                .any(|objective| objective.study_selection_uid == uid));
        }
        Ok(state.references.contains_key(&(kind, uid.to_string())))
    }

    async fn term_order(&self, term_uid: &str) -> Result<Option<u32>> {
        let state = self.state.lock();
        Ok(state
            .references
            .get(&(ReferenceKind::CtTerm, term_uid.to_string()))
            .copied()
            .flatten())
    }

    async fn register_reference(&self, kind: ReferenceKind, uid: &str, order: Option<u32>) -> Result<()> {
        self.state
            .lock()
            .references
            .insert((kind, uid.to_string()), order);
        Ok(())
    }
}

#[async_trait::async_trait]
impl UidGenerator for MemoryStore {
    async fn next_uid(&self, prefix: &str) -> Result<Id> {
        let mut state = self.state.lock();
        let counter = state.counters.entry(prefix.to_string()).or_insert(0);
        *counter += 1;
        Ok(format_uid(prefix, *counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::audit::diff_selections;
    use crate::model::{EndpointSelectionInput, VersionMetadata, FINAL_VERSION_LABEL};

    fn objective(uid: &str) -> StudySelectionObjectiveVO {
        StudySelectionObjectiveVO {
            study_selection_uid: uid.to_string(),
            study_uid: Some("Study_000001".to_string()),
            objective_uid: Some("Objective_000001".to_string()),
            objective_version: None,
            objective_level_uid: None,
            objective_level_order: None,
            start_date: Utc::now(),
            author_id: "a".to_string(),
            accepted_version: false,
        }
    }

    #[tokio::test]
    async fn test_uid_generator_is_monotonic_per_prefix() {
        let store = MemoryStore::new();
        assert_eq!(store.next_uid("StudyEndpoint").await.unwrap(), "StudyEndpoint_000001");
        assert_eq!(store.next_uid("StudyEndpoint").await.unwrap(), "StudyEndpoint_000002");
        assert_eq!(store.next_uid("Concept").await.unwrap(), "Concept_000001");
    }

    #[tokio::test]
    async fn test_stale_lock_token_is_a_conflict() {
        let store = MemoryStore::new();
        store.upsert_parent("Study_000001", ParentState::Draft).await.unwrap();
        let first = store.acquire_lock("Study_000001").await.unwrap();
        let second = store.acquire_lock("Study_000001").await.unwrap();

        let changes = diff_selections("Study_000001", &[], &[objective("A")], "a", Utc::now());
        store.apply_selection_changes(&first, changes.clone()).await.unwrap();

        let err = store.apply_selection_changes(&second, changes).await.unwrap_err();
        assert!(err.downcast_ref::<LockConflict>().is_some());

        let stored: Vec<StudySelectionObjectiveVO> = store.load_selections("Study_000001").await.unwrap();
        assert_eq!(stored.len(), 1);
        let audit: Vec<AuditRecord<StudySelectionObjectiveVO>> =
            store.load_audit_records("Study_000001").await.unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_on_unknown_root_fails() {
        let store = MemoryStore::new();
        assert!(store.acquire_lock("Study_999999").await.is_err());
    }

    #[tokio::test]
    async fn test_append_revisions_chains_end_dates() {
        let store = MemoryStore::new();
        let library = LibraryVO::new("Sponsor", true);
        let initial = VersionMetadata::initial("a", None);
        store
            .create_item(
                "Concept_000001",
                &library,
                vec![Revision {
                    metadata: initial.clone(),
                    value: ConceptValue::named("mg"),
                }],
            )
            .await
            .unwrap();

        let lock = store.acquire_lock("Concept_000001").await.unwrap();
        let approved = initial.approved("a", FINAL_VERSION_LABEL).unwrap();
        store
            .append_revisions(
                &lock,
                "Concept_000001",
                vec![Revision {
                    metadata: approved.clone(),
                    value: ConceptValue::named("mg"),
                }],
                false,
            )
            .await
            .unwrap();

        let revisions = store.load_revisions("Concept_000001").await.unwrap();
        assert_eq!(revisions.len(), 2);
        assert_eq!(revisions[0].metadata.end_date, Some(approved.start_date));
        assert!(revisions[1].metadata.end_date.is_none());

        let head = store.load_item("Concept_000001").await.unwrap().unwrap();
        assert_eq!(head.metadata.version(), "1.0");

        // the token was consumed by the first append
        assert!(store
            .append_revisions(&lock, "Concept_000001", Vec::new(), true)
            .await
            .is_err());
    }

    fn endpoint(uid: &str) -> StudySelectionEndpointVO {
        StudySelectionEndpointVO::from_input_values(
            EndpointSelectionInput {
                endpoint_uid: Some("Endpoint_000001".to_string()),
                ..Default::default()
            },
            None,
            "a",
            Some("Study_000001".to_string()),
            Some(uid.to_string()),
            None,
            crate::model::generate_id,
        )
    }

    #[tokio::test]
    async fn test_study_batch_writes_both_collections_once() {
        let store = MemoryStore::new();
        store.upsert_parent("Study_000001", ParentState::Draft).await.unwrap();
        let lock = store.acquire_lock("Study_000001").await.unwrap();

        store
            .apply_study_selection_batch(
                PendingSelectionWrite {
                    lock: lock.clone(),
                    changes: diff_selections("Study_000001", &[], &[objective("A")], "a", Utc::now()),
                },
                PendingSelectionWrite {
                    lock: lock.clone(),
                    changes: diff_selections("Study_000001", &[], &[endpoint("E")], "a", Utc::now()),
                },
            )
            .await
            .unwrap();

        let objectives: Vec<StudySelectionObjectiveVO> = store.load_selections("Study_000001").await.unwrap();
        let endpoints: Vec<StudySelectionEndpointVO> = store.load_selections("Study_000001").await.unwrap();
        assert_eq!(objectives.len(), 1);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(store.acquire_lock("Study_000001").await.unwrap().version, lock.version + 1);
    }

    #[tokio::test]
    async fn test_study_batch_with_stale_window_writes_nothing() {
        let store = MemoryStore::new();
        store.upsert_parent("Study_000001", ParentState::Draft).await.unwrap();
        let stale = store.acquire_lock("Study_000001").await.unwrap();
        let changes = diff_selections("Study_000001", &[], &[objective("A")], "a", Utc::now());
        store.apply_selection_changes(&stale, changes).await.unwrap();
        let current = store.acquire_lock("Study_000001").await.unwrap();

        let err = store
            .apply_study_selection_batch(
                PendingSelectionWrite {
                    lock: current,
                    changes: diff_selections("Study_000001", &[objective("A")], &[], "a", Utc::now()),
                },
                PendingSelectionWrite {
                    lock: stale,
                    changes: diff_selections("Study_000001", &[], &[endpoint("E")], "a", Utc::now()),
                },
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<LockConflict>().is_some());

        let objectives: Vec<StudySelectionObjectiveVO> = store.load_selections("Study_000001").await.unwrap();
        let endpoints: Vec<StudySelectionEndpointVO> = store.load_selections("Study_000001").await.unwrap();
        assert_eq!(objectives.len(), 1);
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_study_objective_reference_resolves_from_selections() {
        let store = MemoryStore::new();
        store.upsert_parent("Study_000001", ParentState::Draft).await.unwrap();
        assert!(!store
            .reference_exists(ReferenceKind::StudyObjective, "A")
            .await
            .unwrap());

        let lock = store.acquire_lock("Study_000001").await.unwrap();
        let changes = diff_selections("Study_000001", &[], &[objective("A")], "a", Utc::now());
        store.apply_selection_changes(&lock, changes).await.unwrap();

        assert!(store
            .reference_exists(ReferenceKind::StudyObjective, "A")
            .await
            .unwrap());
    }
}
