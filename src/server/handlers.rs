use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::jobs::VerificationJob;
use super::AppState;
use crate::audit::block::ChainBlock;
use crate::audit::event::{validate_partition, NewAuditEvent};
use crate::audit::verify::AuditProof;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{PartitionSummary, StoredBlock};

const MAX_PAGE: usize = 1000;

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordResponse {
    pub event_id: Uuid,
    pub content_hash: String,
    pub chain_position: u64,
}

#[derive(Debug, Deserialize)]
pub struct BlocksQuery {
    pub from: Option<u64>,
    pub limit: Option<usize>,
}

/// One entry of the export feed
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BlockEntry {
    Intact { block: ChainBlock },
    Corrupt { chain_position: u64, reason: String },
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub wait: bool,
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.ledger.store().partitions().await {
        Ok(partitions) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "service": "audit-ledger",
                "partitions": partitions.len(),
                "timestamp": chrono::Utc::now()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "degraded",
                "service": "audit-ledger",
                "error": e.to_string(),
                "timestamp": chrono::Utc::now()
            })),
        ),
    }
}

pub async fn list_partitions(
    State(state): State<AppState>,
) -> LedgerResult<Json<Vec<PartitionSummary>>> {
    Ok(Json(state.ledger.store().partitions().await?))
}

pub async fn record_event(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    Json(request): Json<NewAuditEvent>,
) -> LedgerResult<(StatusCode, Json<RecordResponse>)> {
    let block = state.ledger.record(&partition, request).await?;
    Ok((
        StatusCode::CREATED,
        Json(RecordResponse {
            event_id: block.event.event_id,
            content_hash: block.content_hash.to_string(),
            chain_position: block.chain_position,
        }),
    ))
}

pub async fn list_blocks(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    Query(query): Query<BlocksQuery>,
) -> LedgerResult<Json<Vec<BlockEntry>>> {
    validate_partition(&partition)?;
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_PAGE);
    let blocks = state
        .ledger
        .store()
        .iterate(&partition, query.from.unwrap_or(0), limit)
        .await?;

    Ok(Json(
        blocks
            .into_iter()
            .map(|stored| match stored {
                StoredBlock::Intact(block) => BlockEntry::Intact { block },
                StoredBlock::Corrupt(corrupt) => BlockEntry::Corrupt {
                    chain_position: corrupt.chain_position,
                    reason: corrupt.reason,
                },
            })
            .collect(),
    ))
}

pub async fn get_block(
    State(state): State<AppState>,
    Path((partition, position)): Path<(String, u64)>,
) -> LedgerResult<Json<ChainBlock>> {
    validate_partition(&partition)?;
    state
        .ledger
        .store()
        .get(&partition, position)
        .await?
        .map(Json)
        .ok_or_else(|| {
            LedgerError::NotFound(format!("position {} in partition {}", position, partition))
        })
}

pub async fn get_proof(
    State(state): State<AppState>,
    Path((partition, event_id)): Path<(String, Uuid)>,
) -> LedgerResult<Json<AuditProof>> {
    Ok(Json(state.verifier.verify_one(&partition, &event_id).await?))
}

/// Starts a background job, or verifies inline with `?wait=true`
pub async fn start_verification(
    State(state): State<AppState>,
    Path(partition): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> LedgerResult<Response> {
    if query.wait {
        let result = state.jobs.run(&partition).await?;
        return Ok((StatusCode::OK, Json(result)).into_response());
    }

    let job = state.jobs.start(&partition).await?;
    info!("Verification of {} queued as {}", partition, job.job_id);
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

pub async fn get_verification(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> LedgerResult<Json<VerificationJob>> {
    state
        .jobs
        .get(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| LedgerError::NotFound(format!("verification job {}", job_id)))
}

pub async fn cancel_verification(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> LedgerResult<Json<VerificationJob>> {
    state
        .jobs
        .cancel(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| LedgerError::NotFound(format!("verification job {}", job_id)))
}
