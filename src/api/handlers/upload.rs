use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::request_id::RequestId;
use axum::{
    Extension, Json,
    extract::State,
    http::{HeaderMap, header},
};
use bytes::Bytes;
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub status: String,
    pub upload_id: Uuid,
}

/// Accepts one raw image from the camera.
///
/// Responds as soon as the image is staged; classification and storage
/// happen afterwards and are only visible through the gallery endpoints.
#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Vec<u8>, description = "Raw image bytes", content_type = "image/jpeg"),
    responses(
        (status = 200, description = "Image staged for classification", body = UploadResponse),
        (status = 400, description = "Empty or malformed image"),
        (status = 413, description = "Image too large"),
        (status = 415, description = "Unsupported content type"),
        (status = 500, description = "Staging failed")
    ),
    tag = "camera"
)]
pub async fn upload_image(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let staged = state.ingestion.accept(content_type, &body).await?;
    let upload_id = staged.id;

    info!("📷 Staged {} bytes as upload {}", body.len(), upload_id);

    // Detached: the camera gets its answer now
    state.ingestion.spawn_pipeline(staged, body, request_id.0);

    Ok(Json(UploadResponse {
        status: "staged".to_string(),
        upload_id,
    }))
}
