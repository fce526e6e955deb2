use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{MdrError, MdrResult};
use crate::logic::versioned::LibraryItemAggregate;
use crate::model::{
    Id, LibraryItemStatus, ObjectAction, Page, Revision, VersionMetadata, VersionedValue,
};
use crate::store::repository::LibraryItemRepository;
use crate::store::traits::{AdvisoryLock, LibraryItemStore, LibraryStore, UidGenerator};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryItemView<V> {
    pub uid: Id,
    pub library_name: String,
    #[serde(flatten)]
    pub value: V,
    pub status: LibraryItemStatus,
    pub version: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub author_id: String,
    pub change_description: String,
    pub possible_actions: Vec<ObjectAction>,
}

impl<V: VersionedValue> LibraryItemView<V> {
    pub fn from_aggregate(item: &LibraryItemAggregate<V>) -> MdrResult<Self> {
        let metadata = item.metadata()?;
        Ok(Self {
            uid: item.uid().to_string(),
            library_name: item.library().name.clone(),
            value: item.value()?.clone(),
            status: metadata.status,
            version: metadata.version(),
            start_date: metadata.start_date,
            end_date: metadata.end_date,
            author_id: metadata.author_id.clone(),
            change_description: metadata.change_description.clone(),
            possible_actions: item.possible_actions().into_iter().collect(),
        })
    }
}

/// One revision as listed by the versions endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionView<V> {
    #[serde(flatten)]
    pub value: V,
    pub status: LibraryItemStatus,
    pub version: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub author_id: String,
    pub change_description: String,
}

impl<V> From<Revision<V>> for VersionView<V> {
    fn from(revision: Revision<V>) -> Self {
        let VersionMetadata {
            status,
            start_date,
            end_date,
            author_id,
            change_description,
            ..
        } = revision.metadata.clone();
        Self {
            value: revision.value,
            status,
            version: revision.metadata.version(),
            start_date,
            end_date,
            author_id,
            change_description,
        }
    }
}

/// Library item use cases. Each call runs in its own repository session.
pub struct LibraryItemOperations;

impl LibraryItemOperations {
    pub async fn create_item<St, V>(
        store: &St,
        library_name: &str,
        value: V,
        author_id: &str,
    ) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + LibraryStore + UidGenerator + AdvisoryLock,
        V: VersionedValue,
    {
        let library = store.get_library(library_name).await?.ok_or_else(|| {
            MdrError::not_found(format!(
                "There is no library identified by provided library name ({}).",
                library_name
            ))
        })?;
        let uid = store.next_uid(V::KIND).await?;
        let item = LibraryItemAggregate::create(uid, value, library, author_id, None)?;
        let handle = Arc::new(Mutex::new(item));

        let mut repo = LibraryItemRepository::<St, V>::new(store);
        repo.save(&handle).await?;
        let view = LibraryItemView::from_aggregate(&handle.lock())?;
        repo.close();
        Ok(view)
    }

    pub async fn get_item<St, V>(store: &St, uid: &str) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        let mut repo = LibraryItemRepository::<St, V>::new(store);
        let handle = repo.find_by_uid(uid, false).await?;
        let view = LibraryItemView::from_aggregate(&handle.lock())?;
        repo.close();
        Ok(view)
    }

    pub async fn list_items<St, V>(
        store: &St,
        library_name: Option<&str>,
        page: Page,
    ) -> MdrResult<Vec<LibraryItemView<V>>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        let mut repo = LibraryItemRepository::<St, V>::new(store);
        let items = repo.find_all(library_name, page).await?;
        repo.close();
        items.iter().map(LibraryItemView::from_aggregate).collect()
    }

    pub async fn get_versions<St, V>(store: &St, uid: &str) -> MdrResult<Vec<VersionView<V>>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        let mut repo = LibraryItemRepository::<St, V>::new(store);
        let versions = repo.find_versions(uid).await?;
        repo.close();
        Ok(versions.into_iter().map(VersionView::from).collect())
    }

    /// Loads the item for update, applies `transition` and saves it.
    async fn transition<St, V, F>(store: &St, uid: &str, transition: F) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
        F: FnOnce(&mut LibraryItemAggregate<V>) -> MdrResult<()>,
    {
        let mut repo = LibraryItemRepository::<St, V>::new(store);
        let handle = repo.find_by_uid(uid, true).await?;
        transition(&mut handle.lock())?;
        repo.save(&handle).await?;
        let view = LibraryItemView::from_aggregate(&handle.lock())?;
        repo.close();
        Ok(view)
    }

    pub async fn edit_draft<St, V>(
        store: &St,
        uid: &str,
        value: V,
        change_description: &str,
        author_id: &str,
    ) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        Self::transition(store, uid, |item| {
            item.edit_draft(value, change_description, author_id)
        })
        .await
    }

    pub async fn approve<St, V>(store: &St, uid: &str, author_id: &str) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        Self::transition(store, uid, |item| item.approve(author_id)).await
    }

    pub async fn create_new_version<St, V>(
        store: &St,
        uid: &str,
        author_id: &str,
    ) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        Self::transition(store, uid, |item| item.create_new_version(author_id)).await
    }

    pub async fn inactivate<St, V>(store: &St, uid: &str, author_id: &str) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        Self::transition(store, uid, |item| item.inactivate(author_id)).await
    }

    pub async fn reactivate<St, V>(store: &St, uid: &str, author_id: &str) -> MdrResult<LibraryItemView<V>>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        Self::transition(store, uid, |item| item.reactivate(author_id)).await
    }

    /// Deletes a never-approved item. A refused delete is a business error.
    pub async fn soft_delete<St, V>(store: &St, uid: &str) -> MdrResult<()>
    where
        St: LibraryItemStore<V> + AdvisoryLock,
        V: VersionedValue,
    {
        let mut repo = LibraryItemRepository::<St, V>::new(store);
        let handle = repo.find_by_uid(uid, true).await?;
        handle.lock().soft_delete().map_err(|err| match err {
            MdrError::Versioning { msg, .. } => MdrError::BusinessLogic(msg),
            other => other,
        })?;
        repo.save(&handle).await?;
        repo.close();
        Ok(())
    }
}
