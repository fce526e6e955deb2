//! Request-scoped checkout bookkeeping shared by every repository.
//!
//! A repository session remembers each aggregate it handed out for update and
//! stamps every aggregate with [`RepositoryClosureData`]. The stamp is what
//! makes saves single-use and bound to the session that loaded the aggregate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{business_if, MdrError, MdrResult};
use crate::model::Id;

/// Identity of one repository session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepositoryId(Uuid);

impl RepositoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping attached to an aggregate by the repository that loaded it.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryClosureData<C> {
    pub not_for_update: bool,
    pub additional_closure: Option<C>,
    pub repository: RepositoryId,
}

impl<C> RepositoryClosureData<C> {
    pub fn read_only(repository: RepositoryId) -> Self {
        Self {
            not_for_update: true,
            additional_closure: None,
            repository,
        }
    }

    pub fn for_update(repository: RepositoryId, closure: C) -> Self {
        Self {
            not_for_update: false,
            additional_closure: Some(closure),
            repository,
        }
    }
}

/// Aggregates that carry repository closure data.
pub trait ClosureCarrier {
    type Closure;

    fn aggregate_uid(&self) -> Option<&str>;
    fn closure_slot(&self) -> &Option<RepositoryClosureData<Self::Closure>>;
    fn closure_slot_mut(&mut self) -> &mut Option<RepositoryClosureData<Self::Closure>>;

    fn repository_closure_data(&self) -> Option<&RepositoryClosureData<Self::Closure>> {
        self.closure_slot().as_ref()
    }
}

/// Shared handle to a checked-out aggregate. Every lookup of the same uid
/// within one session yields a clone of the same handle.
pub type AggregateRef<A> = Arc<Mutex<A>>;

/// What a save has to do, decided from the aggregate's closure data.
#[derive(Debug)]
pub enum SavePlan<C> {
    /// Never persisted: write it from scratch.
    Create { uid: Id },
    /// Loaded for update by this session.
    Update { uid: Id, closure: C },
}

#[derive(Debug)]
pub struct CheckoutRegistry<A> {
    id: RepositoryId,
    retrieved_for_update: HashMap<Id, AggregateRef<A>>,
    closed: bool,
}

impl<A: ClosureCarrier> CheckoutRegistry<A> {
    pub fn new() -> Self {
        Self {
            id: RepositoryId::new(),
            retrieved_for_update: HashMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> RepositoryId {
        self.id
    }

    pub fn ensure_open(&self) -> MdrResult<()> {
        business_if(self.closed, || "Cannot use repository after it's closed.".to_string())
    }

    pub fn checked_out(&self, uid: &str) -> Option<AggregateRef<A>> {
        self.retrieved_for_update.get(uid).cloned()
    }

    pub fn checked_out_count(&self) -> usize {
        self.retrieved_for_update.len()
    }

    /// Reporting reads assume a stable storage snapshot.
    pub fn ensure_nothing_checked_out(&self) -> MdrResult<()> {
        business_if(!self.retrieved_for_update.is_empty(), || {
            format!(
                "Cannot read all aggregates while {} aggregate(s) are checked out for update.",
                self.retrieved_for_update.len()
            )
        })
    }

    /// Stamps a freshly loaded aggregate and, when loaded for update, registers it.
    pub fn register(&mut self, uid: &str, mut aggregate: A, closure: Option<A::Closure>) -> AggregateRef<A> {
        let data = match closure {
            Some(closure) => RepositoryClosureData::for_update(self.id, closure),
            None => RepositoryClosureData::read_only(self.id),
        };
        let for_update = !data.not_for_update;
        *aggregate.closure_slot_mut() = Some(data);
        let handle = Arc::new(Mutex::new(aggregate));
        if for_update {
            self.retrieved_for_update.insert(uid.to_string(), handle.clone());
        }
        handle
    }

    /// Checks the save preconditions and takes the closure out of the aggregate.
    ///
    /// An update consumes the closure: the aggregate is left stamped
    /// read-only, so a second save fails even if the write never happens.
    pub fn begin_save(&mut self, aggregate: &mut A) -> MdrResult<SavePlan<A::Closure>> {
        self.ensure_open()?;
        let id = self.id;
        let uid = aggregate.aggregate_uid().map(|s| s.to_string());
        let slot = aggregate.closure_slot_mut();
        let Some(data) = slot.take() else {
            let uid = uid.ok_or_else(|| {
                MdrError::business("Cannot save an aggregate without uid and repository closure data.")
            })?;
            return Ok(SavePlan::Create { uid });
        };
        if data.repository != id {
            *slot = Some(data);
            return Err(MdrError::business(
                "Aggregate instances can be saved only by the repository which has retrieved the instance.",
            ));
        }
        if data.not_for_update {
            *slot = Some(data);
            return Err(MdrError::business(
                "Only aggregate instances retrieved for update can be saved.",
            ));
        }
        *slot = Some(RepositoryClosureData::read_only(id));
        let uid = uid.ok_or_else(|| MdrError::business("Aggregate retrieved for update has no uid."))?;
        let closure = data
            .additional_closure
            .ok_or_else(|| MdrError::business("Aggregate retrieved for update has no closure data."))?;
        Ok(SavePlan::Update { uid, closure })
    }

    /// Stamps a saved aggregate read-only and forgets it; a later
    /// `find_by_uid` reads storage again.
    pub fn finish_save(&mut self, uid: &str, aggregate: &mut A) {
        *aggregate.closure_slot_mut() = Some(RepositoryClosureData::read_only(self.id));
        self.retrieved_for_update.remove(uid);
    }

    pub fn close(&mut self) {
        self.retrieved_for_update.clear();
        self.closed = true;
    }
}

impl<A: ClosureCarrier> Default for CheckoutRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}
