//! Message ingestion handler.
//!
//! - POST /messages -> decode the record header, route it to its partition

use crate::{
    errors::AppError,
    models::record::{MessageHeader, Record},
    state::AppState,
};
use axum::{body::Bytes, extract::State, http::StatusCode};

/// `POST /messages`
///
/// The body is one JSON chat event carrying at least `content_id`,
/// `client_id` and `timestamp` (epoch milliseconds). It is stored verbatim.
/// Returns 204 once the record is queued for its partition, 400 when the
/// body cannot be decoded and 503 when the record cannot be accepted.
pub async fn create_message(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let header: MessageHeader = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid message: {}", e)))?;
    let record = Record::from_message(header, body)?;

    tracing::debug!(
        content_id = record.content_id(),
        client_id = record.client_id(),
        timestamp = record.timestamp_millis(),
        "message accepted"
    );
    state.dispatcher.route(record).await?;

    Ok(StatusCode::NO_CONTENT)
}
