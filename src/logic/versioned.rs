use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use crate::error::{MdrError, MdrResult};
use crate::model::{
    Id, LibraryItemStatus, LibraryVO, ObjectAction, Revision, VersionMetadata, VersionedValue,
    FINAL_VERSION_LABEL, NEW_VERSION_LABEL, REACTIVATED_VERSION_LABEL, RETIRED_VERSION_LABEL,
};
use crate::store::session::{ClosureCarrier, RepositoryClosureData};
use crate::store::traits::LockToken;

/// What the repository remembers about a library item loaded for update.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryItemClosure {
    /// Head revision as read from storage.
    pub head: VersionMetadata,
    pub lock: LockToken,
}

/// A versioned library item: a stable uid owning a chain of revisions.
///
/// Every successful transition changes the in-memory head and queues one
/// revision for the repository to append on save.
#[derive(Debug, Clone)]
pub struct LibraryItemAggregate<V: VersionedValue> {
    uid: Id,
    library: LibraryVO,
    metadata: VersionMetadata,
    value: V,
    deleted: bool,
    pending: Vec<Revision<V>>,
    closure: Option<RepositoryClosureData<LibraryItemClosure>>,
}

impl<V: VersionedValue> LibraryItemAggregate<V> {
    /// Creates a new item in its initial draft version.
    pub fn create(
        uid: Id,
        value: V,
        library: LibraryVO,
        author_id: &str,
        start_date: Option<DateTime<Utc>>,
    ) -> MdrResult<Self> {
        if !library.is_editable {
            return Err(MdrError::business(format!(
                "Library {} does not allow to create objects.",
                library.name
            )));
        }
        value.validate()?;
        let metadata = VersionMetadata::initial(author_id, start_date);
        Ok(Self {
            uid,
            library,
            pending: vec![Revision {
                metadata: metadata.clone(),
                value: value.clone(),
            }],
            metadata,
            value,
            deleted: false,
            closure: None,
        })
    }

    pub fn from_repository_values(
        uid: Id,
        library: LibraryVO,
        metadata: VersionMetadata,
        value: V,
    ) -> Self {
        Self {
            uid,
            library,
            metadata,
            value,
            deleted: false,
            pending: Vec::new(),
            closure: None,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn library(&self) -> &LibraryVO {
        &self.library
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn metadata(&self) -> MdrResult<&VersionMetadata> {
        self.ensure_live()?;
        Ok(&self.metadata)
    }

    pub fn value(&self) -> MdrResult<&V> {
        self.ensure_live()?;
        Ok(&self.value)
    }

    pub fn version(&self) -> MdrResult<String> {
        Ok(self.metadata()?.version())
    }

    pub fn pending_revisions(&self) -> &[Revision<V>] {
        &self.pending
    }

    pub(crate) fn take_pending_revisions(&mut self) -> Vec<Revision<V>> {
        std::mem::take(&mut self.pending)
    }

    fn ensure_live(&self) -> MdrResult<()> {
        if self.deleted {
            return Err(MdrError::business("Cannot use deleted object."));
        }
        Ok(())
    }

    fn ensure_editable_library(&self) -> MdrResult<()> {
        if !self.library.is_editable {
            return Err(MdrError::versioning_with(
                "Library is not editable.",
                403,
                "invalid_status_final",
            ));
        }
        Ok(())
    }

    fn push_revision(&mut self, metadata: VersionMetadata, value: V) {
        self.pending.push(Revision {
            metadata: metadata.clone(),
            value: value.clone(),
        });
        self.metadata = metadata;
        self.value = value;
    }

    pub fn edit_draft(&mut self, value: V, change_description: &str, author_id: &str) -> MdrResult<()> {
        self.ensure_live()?;
        self.ensure_editable_library()?;
        value.validate()?;
        let metadata = self.metadata.edited_draft(author_id, change_description)?;
        self.push_revision(metadata, value);
        Ok(())
    }

    pub fn approve(&mut self, author_id: &str) -> MdrResult<()> {
        self.ensure_live()?;
        self.ensure_editable_library()?;
        let metadata = self.metadata.approved(author_id, FINAL_VERSION_LABEL)?;
        let value = self.value.clone();
        self.push_revision(metadata, value);
        Ok(())
    }

    pub fn create_new_version(&mut self, author_id: &str) -> MdrResult<()> {
        self.ensure_live()?;
        self.ensure_editable_library()?;
        let metadata = self.metadata.new_draft(author_id, NEW_VERSION_LABEL)?;
        let value = self.value.clone();
        self.push_revision(metadata, value);
        Ok(())
    }

    pub fn inactivate(&mut self, author_id: &str) -> MdrResult<()> {
        self.ensure_live()?;
        self.ensure_editable_library()?;
        let metadata = self.metadata.retired(author_id, RETIRED_VERSION_LABEL)?;
        let value = self.value.clone();
        self.push_revision(metadata, value);
        Ok(())
    }

    pub fn reactivate(&mut self, author_id: &str) -> MdrResult<()> {
        self.ensure_live()?;
        self.ensure_editable_library()?;
        let metadata = self.metadata.reactivated(author_id, REACTIVATED_VERSION_LABEL)?;
        let value = self.value.clone();
        self.push_revision(metadata, value);
        Ok(())
    }

    /// Marks a never-approved draft as deleted. No revision is appended.
    pub fn soft_delete(&mut self) -> MdrResult<()> {
        self.ensure_live()?;
        if self.metadata.major_version != 0 {
            return Err(MdrError::versioning("Object has been accepted"));
        }
        self.deleted = true;
        Ok(())
    }

    pub fn possible_actions(&self) -> BTreeSet<ObjectAction> {
        let mut actions = BTreeSet::new();
        if self.deleted || !self.library.is_editable {
            return actions;
        }
        match self.metadata.status {
            LibraryItemStatus::Draft => {
                actions.insert(ObjectAction::Approve);
                actions.insert(ObjectAction::Edit);
                if self.metadata.major_version == 0 {
                    actions.insert(ObjectAction::Delete);
                }
            }
            LibraryItemStatus::Final => {
                actions.insert(ObjectAction::NewVersion);
                actions.insert(ObjectAction::Inactivate);
            }
            LibraryItemStatus::Retired => {
                actions.insert(ObjectAction::NewVersion);
                actions.insert(ObjectAction::Reactivate);
            }
        }
        actions
    }
}

impl<V: VersionedValue> ClosureCarrier for LibraryItemAggregate<V> {
    type Closure = LibraryItemClosure;

    fn aggregate_uid(&self) -> Option<&str> {
        Some(&self.uid)
    }

    fn closure_slot(&self) -> &Option<RepositoryClosureData<LibraryItemClosure>> {
        &self.closure
    }

    fn closure_slot_mut(&mut self) -> &mut Option<RepositoryClosureData<LibraryItemClosure>> {
        &mut self.closure
    }
}
