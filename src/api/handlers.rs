use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Json as RequestJson,
};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{MdrError, MdrResult};
use crate::logic::library_ops::{LibraryItemOperations, LibraryItemView, VersionView};
use crate::logic::selection_ops::{OrderedSelection, StudySelectionOperations};
use crate::model::{
    ConceptValue, EndpointSelectionInput, ObjectiveSelectionInput, Page, ParentState,
    SelectionHistoryEntry, StudySelectionEndpointVO, StudySelectionObjectiveVO, UserContext,
};
use crate::store::traits::{ParentStore, Store};

pub type AppState<S> = Arc<S>;

type ApiResult<T> = Result<Json<T>, MdrError>;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    fn of(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for MdrError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match &self {
            MdrError::Storage(err) => error!("Storage failure: {:#}", err),
            MdrError::Conflict(msg) => warn!("{}", msg),
            _ => {}
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StudyRequest {
    #[serde(default)]
    pub state: ParentState,
}

#[derive(Debug, Serialize)]
pub struct StudyResponse {
    pub uid: String,
    pub state: ParentState,
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub new_order: i64,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub library_name: Option<String>,
    pub page_number: Option<usize>,
    pub page_size: Option<usize>,
}

impl PageQuery {
    fn page(&self) -> Page {
        Page {
            number: self.page_number.unwrap_or(1).max(1),
            size: self.page_size.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewConceptRequest {
    pub library_name: String,
    #[serde(flatten)]
    pub value: ConceptValue,
}

#[derive(Debug, Deserialize)]
pub struct EditConceptRequest {
    pub change_description: String,
    #[serde(flatten)]
    pub value: ConceptValue,
}

// Studies

pub async fn upsert_study<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
    RequestJson(request): RequestJson<StudyRequest>,
) -> ApiResult<StudyResponse> {
    store
        .upsert_parent(&study_uid, request.state)
        .await
        .map_err(MdrError::from)?;
    Ok(Json(StudyResponse {
        uid: study_uid,
        state: request.state,
    }))
}

// Study endpoint selections

pub async fn list_study_endpoints<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
) -> ApiResult<ListResponse<OrderedSelection<StudySelectionEndpointVO>>> {
    let selections = StudySelectionOperations::list_selections::<S, StudySelectionEndpointVO>(&*store, &study_uid).await?;
    Ok(Json(ListResponse::of(selections)))
}

pub async fn get_study_endpoint<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
) -> ApiResult<OrderedSelection<StudySelectionEndpointVO>> {
    let selection =
        StudySelectionOperations::get_selection::<S, StudySelectionEndpointVO>(&*store, &study_uid, &selection_uid).await?;
    Ok(Json(selection))
}

pub async fn add_study_endpoint<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
    user: UserContext,
    RequestJson(input): RequestJson<EndpointSelectionInput>,
) -> Result<(StatusCode, Json<OrderedSelection<StudySelectionEndpointVO>>), MdrError> {
    let selection = StudySelectionOperations::add_endpoint_selection(
        &*store,
        &study_uid,
        input,
        user.author_id(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(selection)))
}

pub async fn patch_study_endpoint<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
    RequestJson(patch): RequestJson<EndpointSelectionInput>,
) -> ApiResult<OrderedSelection<StudySelectionEndpointVO>> {
    let selection = StudySelectionOperations::update_endpoint_selection(
        &*store,
        &study_uid,
        &selection_uid,
        patch,
        user.author_id(),
    )
    .await?;
    Ok(Json(selection))
}

pub async fn reorder_study_endpoint<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
    RequestJson(request): RequestJson<OrderRequest>,
) -> ApiResult<OrderedSelection<StudySelectionEndpointVO>> {
    let selection = StudySelectionOperations::set_selection_order::<S, StudySelectionEndpointVO>(
        &*store,
        &study_uid,
        &selection_uid,
        request.new_order,
        user.author_id(),
    )
    .await?;
    Ok(Json(selection))
}

pub async fn delete_study_endpoint<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
) -> MdrResult<StatusCode> {
    StudySelectionOperations::delete_endpoint_selection(
        &*store,
        &study_uid,
        &selection_uid,
        user.author_id(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn study_endpoints_history<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
) -> ApiResult<Vec<SelectionHistoryEntry<StudySelectionEndpointVO>>> {
    let history = StudySelectionOperations::selection_history::<S, StudySelectionEndpointVO>(
        &*store, &study_uid, None,
    )
    .await?;
    Ok(Json(history))
}

pub async fn study_endpoint_history<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
) -> ApiResult<Vec<SelectionHistoryEntry<StudySelectionEndpointVO>>> {
    let history = StudySelectionOperations::selection_history::<S, StudySelectionEndpointVO>(
        &*store,
        &study_uid,
        Some(&selection_uid),
    )
    .await?;
    Ok(Json(history))
}

// Study objective selections

pub async fn list_study_objectives<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
) -> ApiResult<ListResponse<OrderedSelection<StudySelectionObjectiveVO>>> {
    let selections = StudySelectionOperations::list_selections::<S, StudySelectionObjectiveVO>(&*store, &study_uid).await?;
    Ok(Json(ListResponse::of(selections)))
}

pub async fn get_study_objective<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
) -> ApiResult<OrderedSelection<StudySelectionObjectiveVO>> {
    let selection =
        StudySelectionOperations::get_selection::<S, StudySelectionObjectiveVO>(&*store, &study_uid, &selection_uid).await?;
    Ok(Json(selection))
}

pub async fn add_study_objective<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
    user: UserContext,
    RequestJson(input): RequestJson<ObjectiveSelectionInput>,
) -> Result<(StatusCode, Json<OrderedSelection<StudySelectionObjectiveVO>>), MdrError> {
    let selection = StudySelectionOperations::add_objective_selection(
        &*store,
        &study_uid,
        input,
        user.author_id(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(selection)))
}

pub async fn patch_study_objective<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
    RequestJson(patch): RequestJson<ObjectiveSelectionInput>,
) -> ApiResult<OrderedSelection<StudySelectionObjectiveVO>> {
    let selection = StudySelectionOperations::update_objective_selection(
        &*store,
        &study_uid,
        &selection_uid,
        patch,
        user.author_id(),
    )
    .await?;
    Ok(Json(selection))
}

pub async fn reorder_study_objective<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
    RequestJson(request): RequestJson<OrderRequest>,
) -> ApiResult<OrderedSelection<StudySelectionObjectiveVO>> {
    let selection = StudySelectionOperations::set_selection_order::<S, StudySelectionObjectiveVO>(
        &*store,
        &study_uid,
        &selection_uid,
        request.new_order,
        user.author_id(),
    )
    .await?;
    Ok(Json(selection))
}

pub async fn delete_study_objective<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
    user: UserContext,
) -> MdrResult<StatusCode> {
    StudySelectionOperations::delete_objective_selection(
        &*store,
        &study_uid,
        &selection_uid,
        user.author_id(),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn study_objectives_history<S: Store>(
    State(store): State<AppState<S>>,
    Path(study_uid): Path<String>,
) -> ApiResult<Vec<SelectionHistoryEntry<StudySelectionObjectiveVO>>> {
    let history = StudySelectionOperations::selection_history::<S, StudySelectionObjectiveVO>(
        &*store, &study_uid, None,
    )
    .await?;
    Ok(Json(history))
}

pub async fn study_objective_history<S: Store>(
    State(store): State<AppState<S>>,
    Path((study_uid, selection_uid)): Path<(String, String)>,
) -> ApiResult<Vec<SelectionHistoryEntry<StudySelectionObjectiveVO>>> {
    let history = StudySelectionOperations::selection_history::<S, StudySelectionObjectiveVO>(
        &*store,
        &study_uid,
        Some(&selection_uid),
    )
    .await?;
    Ok(Json(history))
}

// Library concepts

pub async fn list_concepts<S: Store>(
    State(store): State<AppState<S>>,
    Query(query): Query<PageQuery>,
) -> ApiResult<ListResponse<LibraryItemView<ConceptValue>>> {
    let items = LibraryItemOperations::list_items::<S, ConceptValue>(
        &*store,
        query.library_name.as_deref(),
        query.page(),
    )
    .await?;
    Ok(Json(ListResponse::of(items)))
}

pub async fn create_concept<S: Store>(
    State(store): State<AppState<S>>,
    user: UserContext,
    RequestJson(request): RequestJson<NewConceptRequest>,
) -> Result<(StatusCode, Json<LibraryItemView<ConceptValue>>), MdrError> {
    let item = LibraryItemOperations::create_item(
        &*store,
        &request.library_name,
        request.value,
        user.author_id(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn get_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
) -> ApiResult<LibraryItemView<ConceptValue>> {
    Ok(Json(LibraryItemOperations::get_item::<S, ConceptValue>(&*store, &uid).await?))
}

pub async fn concept_versions<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
) -> ApiResult<Vec<VersionView<ConceptValue>>> {
    Ok(Json(LibraryItemOperations::get_versions::<S, ConceptValue>(&*store, &uid).await?))
}

pub async fn edit_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
    user: UserContext,
    RequestJson(request): RequestJson<EditConceptRequest>,
) -> ApiResult<LibraryItemView<ConceptValue>> {
    let item = LibraryItemOperations::edit_draft(
        &*store,
        &uid,
        request.value,
        &request.change_description,
        user.author_id(),
    )
    .await?;
    Ok(Json(item))
}

pub async fn approve_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
    user: UserContext,
) -> ApiResult<LibraryItemView<ConceptValue>> {
    Ok(Json(
        LibraryItemOperations::approve::<S, ConceptValue>(&*store, &uid, user.author_id()).await?,
    ))
}

pub async fn new_concept_version<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
    user: UserContext,
) -> Result<(StatusCode, Json<LibraryItemView<ConceptValue>>), MdrError> {
    let item =
        LibraryItemOperations::create_new_version::<S, ConceptValue>(&*store, &uid, user.author_id())
            .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn inactivate_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
    user: UserContext,
) -> ApiResult<LibraryItemView<ConceptValue>> {
    Ok(Json(
        LibraryItemOperations::inactivate::<S, ConceptValue>(&*store, &uid, user.author_id()).await?,
    ))
}

pub async fn reactivate_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
    user: UserContext,
) -> ApiResult<LibraryItemView<ConceptValue>> {
    Ok(Json(
        LibraryItemOperations::reactivate::<S, ConceptValue>(&*store, &uid, user.author_id()).await?,
    ))
}

pub async fn delete_concept<S: Store>(
    State(store): State<AppState<S>>,
    Path(uid): Path<String>,
) -> MdrResult<StatusCode> {
    LibraryItemOperations::soft_delete::<S, ConceptValue>(&*store, &uid).await?;
    Ok(StatusCode::NO_CONTENT)
}
