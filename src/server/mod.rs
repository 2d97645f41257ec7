//! HTTP API
//!
//! Thin axum layer over the ledger, the chain verifier and the background
//! verification jobs.

pub mod handlers;
pub mod jobs;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::ledger::{AuditLedger, RetryPolicy};
use crate::audit::verify::ChainVerifier;
use crate::config::AppConfig;
use crate::crypto::{KeyProvider, Signer, Verifier};
use crate::error::{ErrorCategory, LedgerError};
use crate::store::ChainStore;

pub use jobs::{JobStatus, VerificationJob, VerificationJobs};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<AuditLedger>,
    pub verifier: ChainVerifier,
    pub jobs: VerificationJobs,
}

impl AppState {
    pub fn new(store: Arc<dyn ChainStore>, keys: Arc<dyn KeyProvider>, config: &AppConfig) -> Self {
        let ledger = AuditLedger::new(
            store.clone(),
            Signer::new(keys.clone()),
            RetryPolicy::from(&config.ledger),
        );
        let verifier = ChainVerifier::new(store, Verifier::new(keys))
            .with_page_size(config.verification.page_size);
        let jobs = VerificationJobs::new(
            verifier.clone(),
            Duration::from_secs(config.verification.deadline_secs),
            config.verification.max_retained_jobs,
        );

        Self {
            ledger: Arc::new(ledger),
            verifier,
            jobs,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/partitions", get(handlers::list_partitions))
        .route(
            "/api/v1/partitions/:partition/events",
            post(handlers::record_event),
        )
        .route(
            "/api/v1/partitions/:partition/blocks",
            get(handlers::list_blocks),
        )
        .route(
            "/api/v1/partitions/:partition/blocks/:position",
            get(handlers::get_block),
        )
        .route(
            "/api/v1/partitions/:partition/proofs/:event_id",
            get(handlers::get_proof),
        )
        .route(
            "/api/v1/partitions/:partition/verify",
            post(handlers::start_verification),
        )
        .route(
            "/api/v1/verifications/:job_id",
            get(handlers::get_verification).delete(handlers::cancel_verification),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match self.category() {
            ErrorCategory::Validation => StatusCode::BAD_REQUEST,
            ErrorCategory::Lookup => StatusCode::NOT_FOUND,
            ErrorCategory::Concurrency => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Infrastructure if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCategory::Infrastructure => {
                error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}
