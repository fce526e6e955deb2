use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::LockConflict;
use crate::logic::audit::SelectionChangeSet;
use crate::model::{
    AuditRecord, ConceptValue, Id, LibraryVO, Page, ParentState, ReferenceKind, Revision,
    Selection, StudySelectionEndpointVO, StudySelectionObjectiveVO, VersionMetadata,
    VersionedValue,
};

/// Write window on an aggregate root.
///
/// `version` is the root's lock version at acquisition; a save carrying a
/// token whose version is no longer current fails with a `LockConflict`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub root_uid: Id,
    pub version: i64,
}

impl LockToken {
    /// Two tokens taken for one write must name the same root at the same version.
    pub fn ensure_same_window(&self, other: &LockToken) -> Result<(), LockConflict> {
        if self == other {
            Ok(())
        } else {
            Err(LockConflict {
                parent_uid: other.root_uid.clone(),
            })
        }
    }
}

/// Cooperative single-writer lock on an aggregate root (a study or a library item)
#[async_trait::async_trait]
pub trait AdvisoryLock: Send + Sync {
    async fn acquire_lock(&self, root_uid: &str) -> Result<LockToken>;
}

/// Roots owning selection collections (studies)
#[async_trait::async_trait]
pub trait ParentStore: Send + Sync {
    async fn parent_state(&self, parent_uid: &str) -> Result<Option<ParentState>>;
    async fn upsert_parent(&self, parent_uid: &str, state: ParentState) -> Result<()>;
}

#[async_trait::async_trait]
pub trait SelectionStore<S: Selection>: Send + Sync {
    /// Current collection of a parent in stored order.
    async fn load_selections(&self, parent_uid: &str) -> Result<Vec<S>>;
    /// Every parent with at least one selection, ordered by parent uid.
    async fn list_selection_parents(&self, page: Page) -> Result<Vec<(Id, Vec<S>)>>;
    /// Replaces the current collection and appends the audit records in one
    /// write, provided `lock` is still current. Bumps the lock version.
    async fn apply_selection_changes(&self, lock: &LockToken, changes: SelectionChangeSet<S>) -> Result<()>;
    async fn load_audit_records(&self, parent_uid: &str) -> Result<Vec<AuditRecord<S>>>;
}

/// A diffed selection save that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSelectionWrite<S> {
    pub lock: LockToken,
    pub changes: SelectionChangeSet<S>,
}

/// Writes the objective and endpoint collections of one study as one unit.
#[async_trait::async_trait]
pub trait StudySelectionBatch: Send + Sync {
    /// Both tokens must be current for the same study. The lock version is
    /// bumped once and nothing is written when either check fails.
    async fn apply_study_selection_batch(
        &self,
        objectives: PendingSelectionWrite<StudySelectionObjectiveVO>,
        endpoints: PendingSelectionWrite<StudySelectionEndpointVO>,
    ) -> Result<()>;
}

/// Head revision of a stored library item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem<V> {
    pub uid: Id,
    pub library: LibraryVO,
    pub metadata: VersionMetadata,
    pub value: V,
    pub deleted: bool,
}

#[async_trait::async_trait]
pub trait LibraryItemStore<V: VersionedValue>: Send + Sync {
    async fn load_item(&self, uid: &str) -> Result<Option<StoredItem<V>>>;
    /// Live items, optionally restricted to one library, ordered by uid.
    async fn list_items(&self, library_name: Option<&str>, page: Page) -> Result<Vec<StoredItem<V>>>;
    /// Registers a new root and writes its first revisions.
    async fn create_item(&self, uid: &str, library: &LibraryVO, revisions: Vec<Revision<V>>) -> Result<()>;
    /// Closes the open head and appends `revisions`, the last becoming the
    /// new head. With `deleted` the item is closed and hidden instead.
    async fn append_revisions(
        &self,
        lock: &LockToken,
        uid: &str,
        revisions: Vec<Revision<V>>,
        deleted: bool,
    ) -> Result<()>;
    /// Every revision, oldest first.
    async fn load_revisions(&self, uid: &str) -> Result<Vec<Revision<V>>>;
}

#[async_trait::async_trait]
pub trait LibraryStore: Send + Sync {
    async fn get_library(&self, name: &str) -> Result<Option<LibraryVO>>;
    async fn upsert_library(&self, library: LibraryVO) -> Result<()>;
}

/// Existence of the items selections point at
#[async_trait::async_trait]
pub trait ReferenceLookup: Send + Sync {
    async fn reference_exists(&self, kind: ReferenceKind, uid: &str) -> Result<bool>;
    /// Ordinal of a CT term inside its codelist, used as a grouping key.
    async fn term_order(&self, term_uid: &str) -> Result<Option<u32>>;
    async fn register_reference(&self, kind: ReferenceKind, uid: &str, order: Option<u32>) -> Result<()>;
}

#[async_trait::async_trait]
pub trait UidGenerator: Send + Sync {
    /// Next `{prefix}_{counter:06}` uid, monotonic per prefix.
    async fn next_uid(&self, prefix: &str) -> Result<Id>;
}

pub trait Store:
    AdvisoryLock
    + ParentStore
    + SelectionStore<StudySelectionEndpointVO>
    + SelectionStore<StudySelectionObjectiveVO>
    + StudySelectionBatch
    + LibraryItemStore<ConceptValue>
    + LibraryStore
    + ReferenceLookup
    + UidGenerator
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: AdvisoryLock
        + ParentStore
        + SelectionStore<StudySelectionEndpointVO>
        + SelectionStore<StudySelectionObjectiveVO>
        + StudySelectionBatch
        + LibraryItemStore<ConceptValue>
        + LibraryStore
        + ReferenceLookup
        + UidGenerator
        + Send
        + Sync
{
}
