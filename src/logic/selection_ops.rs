use log::info;
use serde::Serialize;

use crate::error::{MdrError, MdrResult};
use crate::logic::checks::ResolvedChecks;
use crate::logic::selection_aggregate::SelectionAggregate;
use crate::model::{
    generate_id, EndpointSelectionInput, ObjectiveSelectionInput, Selection,
    SelectionHistoryEntry, StudySelectionEndpointVO, StudySelectionObjectiveVO,
};
use crate::store::repository::SelectionRepository;
use crate::store::traits::{
    AdvisoryLock, ParentStore, ReferenceLookup, SelectionStore, Store, StudySelectionBatch,
};

/// A selection with its 1-based position in the study
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderedSelection<S> {
    pub order: usize,
    #[serde(flatten)]
    pub selection: S,
}

impl<S: Selection> OrderedSelection<S> {
    pub fn of(aggregate: &SelectionAggregate<S>, study_selection_uid: &str) -> MdrResult<Self> {
        let (selection, order) = aggregate.get_specific_selection(study_selection_uid)?;
        Ok(Self {
            order,
            selection: selection.clone(),
        })
    }

    pub fn all(aggregate: &SelectionAggregate<S>) -> Vec<Self> {
        aggregate
            .selections()
            .iter()
            .enumerate()
            .map(|(index, selection)| Self {
                order: index + 1,
                selection: selection.clone(),
            })
            .collect()
    }
}

/// Study selection use cases. Each call runs in its own repository session.
pub struct StudySelectionOperations;

impl StudySelectionOperations {
    async fn term_order<L: ReferenceLookup + ?Sized>(
        lookup: &L,
        term_uid: Option<&str>,
    ) -> MdrResult<Option<u32>> {
        match term_uid.map(str::trim).filter(|uid| !uid.is_empty()) {
            Some(uid) => Ok(lookup.term_order(uid).await?),
            None => Ok(None),
        }
    }

    pub async fn list_selections<St, S>(store: &St, study_uid: &str) -> MdrResult<Vec<OrderedSelection<S>>>
    where
        St: SelectionStore<S> + ParentStore + AdvisoryLock,
        S: Selection,
    {
        let mut repo = SelectionRepository::<St, S>::new(store);
        let handle = repo.find_by_uid(study_uid, false).await?;
        let selections = OrderedSelection::all(&handle.lock());
        repo.close();
        Ok(selections)
    }

    pub async fn get_selection<St, S>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
    ) -> MdrResult<OrderedSelection<S>>
    where
        St: SelectionStore<S> + ParentStore + AdvisoryLock,
        S: Selection,
    {
        let mut repo = SelectionRepository::<St, S>::new(store);
        let handle = repo.find_by_uid(study_uid, false).await?;
        let selection = OrderedSelection::of(&handle.lock(), study_selection_uid)?;
        repo.close();
        Ok(selection)
    }

    pub async fn set_selection_order<St, S>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
        new_order: i64,
        author_id: &str,
    ) -> MdrResult<OrderedSelection<S>>
    where
        St: SelectionStore<S> + ParentStore + AdvisoryLock,
        S: Selection,
    {
        let mut repo = SelectionRepository::<St, S>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;
        handle.lock().set_new_order(study_selection_uid, new_order)?;
        repo.save(&handle, author_id).await?;
        let selection = OrderedSelection::of(&handle.lock(), study_selection_uid)?;
        repo.close();
        Ok(selection)
    }

    pub async fn selection_history<St, S>(
        store: &St,
        study_uid: &str,
        study_selection_uid: Option<&str>,
    ) -> MdrResult<Vec<SelectionHistoryEntry<S>>>
    where
        St: SelectionStore<S> + ParentStore + AdvisoryLock,
        S: Selection,
    {
        let mut repo = SelectionRepository::<St, S>::new(store);
        let history = repo
            .find_selection_history(study_uid, study_selection_uid)
            .await?;
        repo.close();
        Ok(history)
    }

    pub async fn add_endpoint_selection<St: Store>(
        store: &St,
        study_uid: &str,
        input: EndpointSelectionInput,
        author_id: &str,
    ) -> MdrResult<OrderedSelection<StudySelectionEndpointVO>> {
        let mut repo = SelectionRepository::<St, StudySelectionEndpointVO>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;

        let selection_uid = store.next_uid(StudySelectionEndpointVO::KIND).await?;
        let level_order = Self::term_order(store, input.endpoint_level_uid.as_deref()).await?;
        let selection = StudySelectionEndpointVO::from_input_values(
            input,
            level_order,
            author_id,
            Some(study_uid.to_string()),
            Some(selection_uid.clone()),
            None,
            generate_id,
        );
        let checks = ResolvedChecks::for_selection(store, &selection).await?;
        {
            let mut aggregate = handle.lock();
            aggregate.add_selection(selection, &checks)?;
            aggregate.validate()?;
        }
        repo.save(&handle, author_id).await?;
        let added = OrderedSelection::of(&handle.lock(), &selection_uid)?;
        repo.close();
        Ok(added)
    }

    pub async fn update_endpoint_selection<St: Store>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
        patch: EndpointSelectionInput,
        author_id: &str,
    ) -> MdrResult<OrderedSelection<StudySelectionEndpointVO>> {
        let mut repo = SelectionRepository::<St, StudySelectionEndpointVO>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;
        let current = handle
            .lock()
            .get_specific_selection(study_selection_uid)?
            .0
            .clone();

        let merged = patch.merged_over(&current);
        let level_order = Self::term_order(store, merged.endpoint_level_uid.as_deref()).await?;
        let updated = StudySelectionEndpointVO::from_input_values(
            merged,
            level_order,
            author_id,
            current.study_uid.clone(),
            Some(current.study_selection_uid.clone()),
            None,
            generate_id,
        );
        let checks = ResolvedChecks::for_selection(store, &updated).await?;
        {
            let mut aggregate = handle.lock();
            aggregate.update_selection(updated, &checks)?;
            aggregate.validate()?;
        }
        repo.save(&handle, author_id).await?;
        let selection = OrderedSelection::of(&handle.lock(), study_selection_uid)?;
        repo.close();
        Ok(selection)
    }

    pub async fn delete_endpoint_selection<St: Store>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
        author_id: &str,
    ) -> MdrResult<()> {
        let mut repo = SelectionRepository::<St, StudySelectionEndpointVO>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;
        handle.lock().remove_selection(study_selection_uid)?;
        repo.save(&handle, author_id).await?;
        repo.close();
        Ok(())
    }

    pub async fn add_objective_selection<St: Store>(
        store: &St,
        study_uid: &str,
        input: ObjectiveSelectionInput,
        author_id: &str,
    ) -> MdrResult<OrderedSelection<StudySelectionObjectiveVO>> {
        let mut repo = SelectionRepository::<St, StudySelectionObjectiveVO>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;

        let selection_uid = store.next_uid(StudySelectionObjectiveVO::KIND).await?;
        let level_order = Self::term_order(store, input.objective_level_uid.as_deref()).await?;
        let selection = StudySelectionObjectiveVO::from_input_values(
            input,
            level_order,
            author_id,
            Some(study_uid.to_string()),
            Some(selection_uid.clone()),
            None,
            generate_id,
        );
        let checks = ResolvedChecks::for_selection(store, &selection).await?;
        {
            let mut aggregate = handle.lock();
            aggregate.add_selection(selection, &checks)?;
            aggregate.validate()?;
        }
        repo.save(&handle, author_id).await?;
        let added = OrderedSelection::of(&handle.lock(), &selection_uid)?;
        repo.close();
        Ok(added)
    }

    pub async fn update_objective_selection<St: Store>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
        patch: ObjectiveSelectionInput,
        author_id: &str,
    ) -> MdrResult<OrderedSelection<StudySelectionObjectiveVO>> {
        let mut repo = SelectionRepository::<St, StudySelectionObjectiveVO>::new(store);
        let handle = repo.find_by_uid(study_uid, true).await?;
        let current = handle
            .lock()
            .get_specific_selection(study_selection_uid)?
            .0
            .clone();

        let merged = patch.merged_over(&current);
        let level_order = Self::term_order(store, merged.objective_level_uid.as_deref()).await?;
        let updated = StudySelectionObjectiveVO::from_input_values(
            merged,
            level_order,
            author_id,
            current.study_uid.clone(),
            Some(current.study_selection_uid.clone()),
            None,
            generate_id,
        );
        let checks = ResolvedChecks::for_selection(store, &updated).await?;
        {
            let mut aggregate = handle.lock();
            aggregate.update_selection(updated, &checks)?;
            aggregate.validate()?;
        }
        repo.save(&handle, author_id).await?;
        let selection = OrderedSelection::of(&handle.lock(), study_selection_uid)?;
        repo.close();
        Ok(selection)
    }

    /// Removes an objective selection and detaches the endpoints that pointed
    /// at it. Both collections are written together or not at all.
    pub async fn delete_objective_selection<St: Store>(
        store: &St,
        study_uid: &str,
        study_selection_uid: &str,
        author_id: &str,
    ) -> MdrResult<()> {
        let mut objectives = SelectionRepository::<St, StudySelectionObjectiveVO>::new(store);
        let mut endpoints = SelectionRepository::<St, StudySelectionEndpointVO>::new(store);
        let objective_handle = objectives.find_by_uid(study_uid, true).await?;
        let endpoint_handle = endpoints.find_by_uid(study_uid, true).await?;

        objective_handle.lock().remove_selection(study_selection_uid)?;
        let detached = {
            let mut aggregate = endpoint_handle.lock();
            let detached = aggregate.deleting_study_objective(study_selection_uid);
            aggregate.validate()?;
            detached
        };

        let objective_write = objectives.prepare_save(&objective_handle, author_id).await?;
        let endpoint_write = endpoints.prepare_save(&endpoint_handle, author_id).await?;
        let actions = objective_write.changes.records.len() + endpoint_write.changes.records.len();
        store
            .apply_study_selection_batch(objective_write, endpoint_write)
            .await
            .map_err(MdrError::from)?;
        objectives.close();
        endpoints.close();

        info!(
            "Deleted study objective '{}' of '{}' with {} audit action(s), detached {} endpoint selection(s)",
            study_selection_uid, study_uid, actions, detached
        );
        Ok(())
    }
}
