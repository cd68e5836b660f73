use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::{ErrorResponse, LockHolderResponse, LockInfoResponse};
use crate::state::AppState;

/// Current lock of a document
pub async fn doc_lock(
    State(app_state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<(StatusCode, Json<LockInfoResponse>), (StatusCode, Json<ErrorResponse>)> {
    let document_id = Uuid::parse_str(&doc_id).map_err(|_| {
        ErrorResponse::reply(StatusCode::BAD_REQUEST, format!("Invalid document id '{}'", doc_id))
    })?;

    let row = match app_state.store.get(document_id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            return Err(ErrorResponse::reply(
                StatusCode::NOT_FOUND,
                format!("Document {} not found", document_id),
            ))
        }
        Err(e) => {
            error!("Failed to load document {}: {}", document_id, e);
            return Err(ErrorResponse::reply(
                StatusCode::SERVICE_UNAVAILABLE,
                "Document store unavailable",
            ));
        }
    };

    let holder = match row.locked_by.as_deref() {
        Some(user_id) => match app_state.directory.resolve(user_id).await {
            Ok(profile) => Some(LockHolderResponse {
                display_name: profile.display_name,
                avatar: profile.avatar,
            }),
            Err(e) => {
                warn!("Could not resolve lock holder {}: {}", user_id, e);
                Some(LockHolderResponse {
                    display_name: user_id.to_string(),
                    avatar: None,
                })
            }
        },
        None => None,
    };

    Ok((
        StatusCode::OK,
        Json(LockInfoResponse {
            document_id,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            holder,
        }),
    ))
}
