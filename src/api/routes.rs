use axum::{
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::handlers;
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<Arc<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Studies
        .route("/studies/:study_uid", put(handlers::upsert_study::<S>))
        // Study endpoint selections
        .route(
            "/studies/:study_uid/study-endpoints",
            get(handlers::list_study_endpoints::<S>).post(handlers::add_study_endpoint::<S>),
        )
        .route(
            "/studies/:study_uid/study-endpoints/audit-trail",
            get(handlers::study_endpoints_history::<S>),
        )
        .route(
            "/studies/:study_uid/study-endpoints/:selection_uid",
            get(handlers::get_study_endpoint::<S>)
                .patch(handlers::patch_study_endpoint::<S>)
                .delete(handlers::delete_study_endpoint::<S>),
        )
        .route(
            "/studies/:study_uid/study-endpoints/:selection_uid/order",
            patch(handlers::reorder_study_endpoint::<S>),
        )
        .route(
            "/studies/:study_uid/study-endpoints/:selection_uid/audit-trail",
            get(handlers::study_endpoint_history::<S>),
        )
        // Study objective selections
        .route(
            "/studies/:study_uid/study-objectives",
            get(handlers::list_study_objectives::<S>).post(handlers::add_study_objective::<S>),
        )
        .route(
            "/studies/:study_uid/study-objectives/audit-trail",
            get(handlers::study_objectives_history::<S>),
        )
        .route(
            "/studies/:study_uid/study-objectives/:selection_uid",
            get(handlers::get_study_objective::<S>)
                .patch(handlers::patch_study_objective::<S>)
                .delete(handlers::delete_study_objective::<S>),
        )
        .route(
            "/studies/:study_uid/study-objectives/:selection_uid/order",
            patch(handlers::reorder_study_objective::<S>),
        )
        .route(
            "/studies/:study_uid/study-objectives/:selection_uid/audit-trail",
            get(handlers::study_objective_history::<S>),
        )
        // Library concepts
        .route(
            "/concepts",
            get(handlers::list_concepts::<S>).post(handlers::create_concept::<S>),
        )
        .route(
            "/concepts/:uid",
            get(handlers::get_concept::<S>)
                .patch(handlers::edit_concept::<S>)
                .delete(handlers::delete_concept::<S>),
        )
        .route(
            "/concepts/:uid/versions",
            get(handlers::concept_versions::<S>).post(handlers::new_concept_version::<S>),
        )
        .route("/concepts/:uid/approvals", post(handlers::approve_concept::<S>))
        .route(
            "/concepts/:uid/activations",
            post(handlers::reactivate_concept::<S>).delete(handlers::inactivate_concept::<S>),
        )
}
