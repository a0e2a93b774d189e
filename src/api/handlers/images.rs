use crate::AppState;
use crate::api::error::AppError;
use crate::services::gallery::{ImageRecord, ImageSummary};
use axum::{
    Json,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};

fn image_response(record: ImageRecord, cache_control: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, record.content_type),
            (header::CACHE_CONTROL, cache_control.to_string()),
        ],
        record.data,
    )
        .into_response()
}

#[utoipa::path(
    get,
    path = "/latest",
    responses(
        (status = 200, description = "Most recently stored image", body = Vec<u8>, content_type = "image/jpeg"),
        (status = 404, description = "No image stored yet")
    ),
    tag = "gallery"
)]
pub async fn latest_image(State(state): State<AppState>) -> Result<Response, AppError> {
    let record = state
        .gallery
        .fetch_latest()
        .await?
        .ok_or_else(|| AppError::NotFound("No image stored yet".to_string()))?;

    Ok(image_response(record, "no-store"))
}

#[utoipa::path(
    get,
    path = "/images",
    responses(
        (status = 200, description = "Stored images, oldest first", body = Vec<ImageSummary>)
    ),
    tag = "gallery"
)]
pub async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<ImageSummary>>, AppError> {
    Ok(Json(state.gallery.list_summaries().await?))
}

#[utoipa::path(
    get,
    path = "/image/{id}",
    params(
        ("id" = i32, Path, description = "Image ID")
    ),
    responses(
        (status = 200, description = "Stored image", body = Vec<u8>, content_type = "image/jpeg"),
        (status = 404, description = "Image not found")
    ),
    tag = "gallery"
)]
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Response, AppError> {
    let record = state
        .gallery
        .fetch_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Image {} not found", id)))?;

    // Stored images never change
    Ok(image_response(record, "public, max-age=31536000, immutable"))
}
