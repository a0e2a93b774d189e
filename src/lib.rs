pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod services;

use crate::config::IngestConfig;
use crate::services::classifier::Classifier;
use crate::services::gallery::{ImageStore, SeaOrmImageStore};
use crate::services::ingestion::IngestionService;
use crate::services::staging::StagingStore;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_image,
        api::handlers::images::latest_image,
        api::handlers::images::list_images,
        api::handlers::images::get_image,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::upload::UploadResponse,
            api::handlers::health::HealthResponse,
            services::gallery::ImageSummary,
        )
    ),
    tags(
        (name = "camera", description = "Camera upload endpoint"),
        (name = "gallery", description = "Stored detections"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub ingestion: Arc<IngestionService>,
    pub gallery: Arc<dyn ImageStore>,
    pub classifier: Arc<dyn Classifier>,
    pub config: IngestConfig,
}

impl AppState {
    pub fn new(
        db: DatabaseConnection,
        config: IngestConfig,
        staging: Arc<StagingStore>,
        classifier: Arc<dyn Classifier>,
        tracker: TaskTracker,
    ) -> Self {
        let gallery: Arc<dyn ImageStore> = Arc::new(SeaOrmImageStore::new(db.clone()));
        let ingestion = Arc::new(IngestionService::new(
            staging,
            classifier.clone(),
            gallery.clone(),
            tracker,
            &config,
        ));

        Self {
            db,
            ingestion,
            gallery,
            classifier,
            config,
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/upload",
            post(api::handlers::upload::upload_image)
                .layer(DefaultBodyLimit::max(state.config.max_upload_size)),
        )
        .route("/latest", get(api::handlers::images::latest_image))
        .route("/images", get(api::handlers::images::list_images))
        .route("/image/:id", get(api::handlers::images::get_image))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
