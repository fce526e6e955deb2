//! Request-scoped repositories: the only way aggregates are loaded and saved.

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::{MdrError, MdrResult};
use crate::logic::audit::{build_history, diff_selections};
use crate::logic::selection_aggregate::{SelectionAggregate, SelectionClosure};
use crate::logic::versioned::{LibraryItemAggregate, LibraryItemClosure};
use crate::model::{
    LibraryVO, Page, ParentState, Revision, Selection, SelectionHistoryEntry, VersionedValue,
};
use crate::store::session::{AggregateRef, CheckoutRegistry, ClosureCarrier, RepositoryClosureData, SavePlan};
use crate::store::traits::{
    AdvisoryLock, LibraryItemStore, ParentStore, PendingSelectionWrite, SelectionStore,
};

fn log_conflict(err: MdrError, uid: &str) -> MdrError {
    if err.is_retryable() {
        warn!("Stale write rejected for '{}': {}", uid, err);
    }
    err
}

/// Loads and saves the selection collection of one kind for studies.
pub struct SelectionRepository<'a, St: ?Sized, S: Selection> {
    store: &'a St,
    registry: CheckoutRegistry<SelectionAggregate<S>>,
}

impl<'a, St, S> SelectionRepository<'a, St, S>
where
    St: SelectionStore<S> + ParentStore + AdvisoryLock + ?Sized,
    S: Selection,
{
    pub fn new(store: &'a St) -> Self {
        Self {
            store,
            registry: CheckoutRegistry::new(),
        }
    }

    async fn require_parent(&self, parent_uid: &str) -> MdrResult<ParentState> {
        self.store
            .parent_state(parent_uid)
            .await?
            .ok_or_else(|| MdrError::not_found(format!("Study '{}' not found.", parent_uid)))
    }

    /// Loads the aggregate of `parent_uid`.
    ///
    /// An aggregate already checked out by this session is returned as the
    /// same instance without touching storage. With `for_update` the parent's
    /// advisory lock is taken before reading.
    pub async fn find_by_uid(
        &mut self,
        parent_uid: &str,
        for_update: bool,
    ) -> MdrResult<AggregateRef<SelectionAggregate<S>>> {
        self.registry.ensure_open()?;
        if let Some(existing) = self.registry.checked_out(parent_uid) {
            return Ok(existing);
        }
        self.require_parent(parent_uid).await?;

        let lock = if for_update {
            let lock = self.store.acquire_lock(parent_uid).await?;
            debug!("Acquired write lock on '{}' at version {}", parent_uid, lock.version);
            Some(lock)
        } else {
            None
        };
        let selections = self.store.load_selections(parent_uid).await?;
        let closure = lock.map(|lock| SelectionClosure {
            loaded: selections.clone(),
            lock,
        });
        let aggregate = SelectionAggregate::from_repository_values(parent_uid, selections);
        Ok(self.registry.register(parent_uid, aggregate, closure))
    }

    /// Every non-empty aggregate, read-only.
    pub async fn find_all(&self, page: Page) -> MdrResult<Vec<SelectionAggregate<S>>> {
        self.registry.ensure_open()?;
        self.registry.ensure_nothing_checked_out()?;
        let parents = self.store.list_selection_parents(page).await?;
        Ok(parents
            .into_iter()
            .map(|(parent_uid, selections)| {
                let mut aggregate = SelectionAggregate::from_repository_values(parent_uid, selections);
                *aggregate.closure_slot_mut() = Some(RepositoryClosureData::read_only(self.registry.id()));
                aggregate
            })
            .collect())
    }

    /// Persists the aggregate and its audit trail. Single use per load.
    pub async fn save(
        &mut self,
        handle: &AggregateRef<SelectionAggregate<S>>,
        author_id: &str,
    ) -> MdrResult<()> {
        let pending = self.prepare_save(handle, author_id).await?;
        let parent_uid = pending.changes.parent_uid.clone();
        if pending.changes.is_empty() {
            debug!("Nothing to save for {} of '{}'", S::KIND, parent_uid);
            return Ok(());
        }
        let actions = pending.changes.records.len();
        self.store
            .apply_selection_changes(&pending.lock, pending.changes)
            .await
            .map_err(|err| log_conflict(err.into(), &parent_uid))?;
        info!(
            "Saved {} of '{}' with {} audit action(s)",
            S::KIND,
            parent_uid,
            actions
        );
        Ok(())
    }

    /// Runs every check of `save` and diffs the aggregate against its load,
    /// leaving the write to the caller. Ends the checkout like `save` does.
    pub async fn prepare_save(
        &mut self,
        handle: &AggregateRef<SelectionAggregate<S>>,
        author_id: &str,
    ) -> MdrResult<PendingSelectionWrite<S>> {
        let (plan, parent_uid, current) = {
            let mut aggregate = handle.lock();
            let plan = self.registry.begin_save(&mut aggregate)?;
            (
                plan,
                aggregate.parent_uid().to_string(),
                aggregate.selections().to_vec(),
            )
        };
        let outcome = self.plan_write(plan, &parent_uid, current, author_id).await;
        self.registry.finish_save(&parent_uid, &mut handle.lock());
        outcome.map_err(|err| log_conflict(err, &parent_uid))
    }

    async fn plan_write(
        &self,
        plan: SavePlan<SelectionClosure<S>>,
        parent_uid: &str,
        current: Vec<S>,
        author_id: &str,
    ) -> MdrResult<PendingSelectionWrite<S>> {
        let state = self.require_parent(parent_uid).await?;
        if state != ParentState::Draft {
            return Err(MdrError::versioning(
                "You cannot add or reorder a study selection when the study is in a released/locked state.",
            ));
        }

        let (loaded, lock) = match plan {
            SavePlan::Update { closure, .. } => (closure.loaded, closure.lock),
            SavePlan::Create { .. } => {
                let lock = self.store.acquire_lock(parent_uid).await?;
                let stored = self.store.load_selections(parent_uid).await?;
                if !stored.is_empty() {
                    return Err(MdrError::already_exists(format!(
                        "Study '{}' already has {} selections.",
                        parent_uid,
                        S::DISPLAY_NAME
                    )));
                }
                (Vec::new(), lock)
            }
        };

        let changes = diff_selections(parent_uid, &loaded, &current, author_id, Utc::now());
        Ok(PendingSelectionWrite { lock, changes })
    }

    /// History of one selection, or of every selection of the study, newest first.
    pub async fn find_selection_history(
        &self,
        parent_uid: &str,
        study_selection_uid: Option<&str>,
    ) -> MdrResult<Vec<SelectionHistoryEntry<S>>> {
        self.registry.ensure_open()?;
        self.require_parent(parent_uid).await?;
        let records = self.store.load_audit_records(parent_uid).await?;
        let history = build_history(&records, study_selection_uid);
        if let Some(uid) = study_selection_uid {
            if history.is_empty() {
                return Err(MdrError::not_found(format!(
                    "There is no history for the {} '{}' in study '{}'.",
                    S::DISPLAY_NAME,
                    uid,
                    parent_uid
                )));
            }
        }
        Ok(history)
    }

    pub fn close(&mut self) {
        self.registry.close();
    }
}

/// Loads and saves versioned library items of one value type.
pub struct LibraryItemRepository<'a, St: ?Sized, V: VersionedValue> {
    store: &'a St,
    registry: CheckoutRegistry<LibraryItemAggregate<V>>,
}

impl<'a, St, V> LibraryItemRepository<'a, St, V>
where
    St: LibraryItemStore<V> + AdvisoryLock + ?Sized,
    V: VersionedValue,
{
    pub fn new(store: &'a St) -> Self {
        Self {
            store,
            registry: CheckoutRegistry::new(),
        }
    }

    fn not_found(uid: &str) -> MdrError {
        MdrError::not_found(format!("{} with UID '{}' doesn't exist.", V::KIND, uid))
    }

    pub async fn find_by_uid(
        &mut self,
        uid: &str,
        for_update: bool,
    ) -> MdrResult<AggregateRef<LibraryItemAggregate<V>>> {
        self.registry.ensure_open()?;
        if let Some(existing) = self.registry.checked_out(uid) {
            return Ok(existing);
        }
        let exists = self
            .store
            .load_item(uid)
            .await?
            .is_some_and(|item| !item.deleted);
        if !exists {
            return Err(Self::not_found(uid));
        }

        let lock = if for_update {
            Some(self.store.acquire_lock(uid).await?)
        } else {
            None
        };
        // read again once the lock is held
        let item = self
            .store
            .load_item(uid)
            .await?
            .filter(|item| !item.deleted)
            .ok_or_else(|| Self::not_found(uid))?;
        let closure = lock.map(|lock| LibraryItemClosure {
            head: item.metadata.clone(),
            lock,
        });
        let aggregate =
            LibraryItemAggregate::from_repository_values(item.uid, item.library, item.metadata, item.value);
        Ok(self.registry.register(uid, aggregate, closure))
    }

    pub async fn find_all(
        &self,
        library_name: Option<&str>,
        page: Page,
    ) -> MdrResult<Vec<LibraryItemAggregate<V>>> {
        self.registry.ensure_open()?;
        self.registry.ensure_nothing_checked_out()?;
        let items = self.store.list_items(library_name, page).await?;
        Ok(items
            .into_iter()
            .map(|item| {
                let mut aggregate = LibraryItemAggregate::from_repository_values(
                    item.uid,
                    item.library,
                    item.metadata,
                    item.value,
                );
                *aggregate.closure_slot_mut() = Some(RepositoryClosureData::read_only(self.registry.id()));
                aggregate
            })
            .collect())
    }

    /// Every revision of an item, newest first.
    pub async fn find_versions(&self, uid: &str) -> MdrResult<Vec<Revision<V>>> {
        self.registry.ensure_open()?;
        let mut revisions = self.store.load_revisions(uid).await?;
        if revisions.is_empty() {
            return Err(Self::not_found(uid));
        }
        revisions.reverse();
        Ok(revisions)
    }

    pub async fn save(&mut self, handle: &AggregateRef<LibraryItemAggregate<V>>) -> MdrResult<()> {
        let (plan, uid, library, revisions, deleted) = {
            let mut aggregate = handle.lock();
            let plan = self.registry.begin_save(&mut aggregate)?;
            (
                plan,
                aggregate.uid().to_string(),
                aggregate.library().clone(),
                aggregate.take_pending_revisions(),
                aggregate.is_deleted(),
            )
        };
        let count = revisions.len();
        let outcome = self.write(plan, &uid, &library, revisions, deleted).await;
        self.registry.finish_save(&uid, &mut handle.lock());
        outcome.map_err(|err| log_conflict(err, &uid))?;
        if deleted {
            info!("Deleted {} '{}'", V::KIND, uid);
        } else {
            info!("Saved {} '{}' with {} new revision(s)", V::KIND, uid, count);
        }
        Ok(())
    }

    async fn write(
        &self,
        plan: SavePlan<LibraryItemClosure>,
        uid: &str,
        library: &LibraryVO,
        revisions: Vec<Revision<V>>,
        deleted: bool,
    ) -> MdrResult<()> {
        match plan {
            SavePlan::Create { .. } => {
                if deleted || revisions.is_empty() {
                    return Err(MdrError::business(
                        "A new library item must be saved with its initial version.",
                    ));
                }
                if self.store.load_item(uid).await?.is_some() {
                    return Err(MdrError::already_exists(format!(
                        "{} with UID '{}' already exists.",
                        V::KIND,
                        uid
                    )));
                }
                self.store.create_item(uid, library, revisions).await?;
            }
            SavePlan::Update { closure, .. } => {
                if revisions.is_empty() && !deleted {
                    debug!("Nothing to save for {} '{}'", V::KIND, uid);
                    return Ok(());
                }
                self.store
                    .append_revisions(&closure.lock, uid, revisions, deleted)
                    .await?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self) {
        self.registry.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AcceptAll, ChangeType, ConceptValue, LibraryItemStatus, StudySelectionObjectiveVO,
    };
    use crate::store::memory::MemoryStore;
    use crate::store::traits::ParentStore;
    use std::sync::Arc;

    const STUDY: &str = "Study_000001";

    fn objective(uid: &str, objective_uid: &str) -> StudySelectionObjectiveVO {
        StudySelectionObjectiveVO {
            study_selection_uid: uid.to_string(),
            study_uid: Some(STUDY.to_string()),
            objective_uid: Some(objective_uid.to_string()),
            objective_version: None,
            objective_level_uid: None,
            objective_level_order: Some(1),
            start_date: Utc::now(),
            author_id: "creator".to_string(),
            accepted_version: false,
        }
    }

    async fn store_with_study() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_parent(STUDY, ParentState::Draft).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_checked_out_aggregate_is_the_same_instance() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);

        let first = repo.find_by_uid(STUDY, true).await.unwrap();
        first
            .lock()
            .add_selection(objective("A", "O1"), &AcceptAll)
            .unwrap();
        let second = repo.find_by_uid(STUDY, false).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_save_is_single_use() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);

        let handle = repo.find_by_uid(STUDY, true).await.unwrap();
        handle
            .lock()
            .add_selection(objective("A", "O1"), &AcceptAll)
            .unwrap();
        repo.save(&handle, "saver").await.unwrap();

        let err = repo.save(&handle, "saver").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Only aggregate instances retrieved for update can be saved."
        );

        // a new checkout reads the saved state
        let reloaded = repo.find_by_uid(STUDY, true).await.unwrap();
        assert!(!Arc::ptr_eq(&handle, &reloaded));
        assert_eq!(reloaded.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_aggregate_cannot_be_saved() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        let handle = repo.find_by_uid(STUDY, false).await.unwrap();
        assert!(matches!(
            repo.save(&handle, "saver").await,
            Err(MdrError::BusinessLogic(_))
        ));
    }

    #[tokio::test]
    async fn test_save_through_other_session_is_rejected() {
        let store = store_with_study().await;
        let mut owner = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        let mut other = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);

        let handle = owner.find_by_uid(STUDY, true).await.unwrap();
        let err = other.save(&handle, "saver").await.unwrap_err();
        assert!(err.to_string().contains("only by the repository"));
    }

    #[tokio::test]
    async fn test_find_all_refused_while_checked_out() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        assert!(repo.find_all(Page::default()).await.unwrap().is_empty());

        let handle = repo.find_by_uid(STUDY, true).await.unwrap();
        assert!(repo.find_all(Page::default()).await.is_err());

        handle
            .lock()
            .add_selection(objective("A", "O1"), &AcceptAll)
            .unwrap();
        repo.save(&handle, "saver").await.unwrap();
        let all = repo.find_all(Page::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].parent_uid(), STUDY);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_conflict() {
        let store = store_with_study().await;
        let mut first = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        let mut second = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);

        let a = first.find_by_uid(STUDY, true).await.unwrap();
        let b = second.find_by_uid(STUDY, true).await.unwrap();
        a.lock().add_selection(objective("A", "O1"), &AcceptAll).unwrap();
        b.lock().add_selection(objective("B", "O2"), &AcceptAll).unwrap();

        first.save(&a, "first").await.unwrap();
        let err = second.save(&b, "second").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 409);

        let mut reader = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        let current = reader.find_by_uid(STUDY, false).await.unwrap();
        assert_eq!(current.lock().selections()[0].study_selection_uid, "A");
    }

    #[tokio::test]
    async fn test_released_study_rejects_save() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        let handle = repo.find_by_uid(STUDY, true).await.unwrap();
        handle
            .lock()
            .add_selection(objective("A", "O1"), &AcceptAll)
            .unwrap();
        store.upsert_parent(STUDY, ParentState::Released).await.unwrap();

        let err = repo.save(&handle, "saver").await.unwrap_err();
        assert!(matches!(err, MdrError::Versioning { .. }));
        assert!(err.to_string().contains("released/locked"));
    }

    #[tokio::test]
    async fn test_closed_repository_rejects_calls() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        repo.close();
        let err = repo.find_by_uid(STUDY, false).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot use repository after it's closed.");
    }

    #[tokio::test]
    async fn test_unknown_study_is_not_found() {
        let store = MemoryStore::new();
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);
        assert!(matches!(
            repo.find_by_uid("Study_404", true).await,
            Err(MdrError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_after_two_saves() {
        let store = store_with_study().await;
        let mut repo = SelectionRepository::<_, StudySelectionObjectiveVO>::new(&store);

        let handle = repo.find_by_uid(STUDY, true).await.unwrap();
        handle
            .lock()
            .add_selection(objective("A", "O1"), &AcceptAll)
            .unwrap();
        repo.save(&handle, "saver").await.unwrap();

        let handle = repo.find_by_uid(STUDY, true).await.unwrap();
        handle.lock().remove_selection("A").unwrap();
        repo.save(&handle, "remover").await.unwrap();

        let history = repo.find_selection_history(STUDY, Some("A")).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].change_type, ChangeType::Delete);
        assert_eq!(history[0].author_id, "remover");
        assert_eq!(history[1].change_type, ChangeType::Create);
        assert!(history[1].end_date.is_some());

        assert!(matches!(
            repo.find_selection_history(STUDY, Some("missing")).await,
            Err(MdrError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_library_item_lifecycle_through_repository() {
        let store = MemoryStore::new();
        let mut repo = LibraryItemRepository::<_, ConceptValue>::new(&store);

        let item = LibraryItemAggregate::create(
            "Concept_000001".to_string(),
            ConceptValue::named("mg"),
            crate::model::LibraryVO::new("Sponsor", true),
            "author",
            None,
        )
        .unwrap();
        let handle = Arc::new(parking_lot::Mutex::new(item));
        repo.save(&handle).await.unwrap();
        assert!(repo.save(&handle).await.is_err());

        let handle = repo.find_by_uid("Concept_000001", true).await.unwrap();
        handle.lock().approve("approver").unwrap();
        repo.save(&handle).await.unwrap();

        let handle = repo.find_by_uid("Concept_000001", true).await.unwrap();
        handle.lock().create_new_version("author").unwrap();
        repo.save(&handle).await.unwrap();

        let versions = repo.find_versions("Concept_000001").await.unwrap();
        let labels: Vec<_> = versions.iter().map(|r| r.metadata.version()).collect();
        assert_eq!(labels, vec!["1.1", "1.0", "0.1"]);
        assert_eq!(versions[0].metadata.status, LibraryItemStatus::Draft);
        assert!(versions[0].metadata.end_date.is_none());
        assert!(versions[1].metadata.end_date.is_some());
    }

    #[tokio::test]
    async fn test_soft_deleted_item_disappears() {
        let store = MemoryStore::new();
        let mut repo = LibraryItemRepository::<_, ConceptValue>::new(&store);
        let item = LibraryItemAggregate::create(
            "Concept_000001".to_string(),
            ConceptValue::named("mg"),
            crate::model::LibraryVO::new("Sponsor", true),
            "author",
            None,
        )
        .unwrap();
        repo.save(&Arc::new(parking_lot::Mutex::new(item))).await.unwrap();

        let handle = repo.find_by_uid("Concept_000001", true).await.unwrap();
        handle.lock().soft_delete().unwrap();
        repo.save(&handle).await.unwrap();

        assert!(matches!(
            repo.find_by_uid("Concept_000001", false).await,
            Err(MdrError::NotFound(_))
        ));
        assert!(repo.find_all(None, Page::default()).await.unwrap().is_empty());
    }
}
