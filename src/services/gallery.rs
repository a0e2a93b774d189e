use crate::entities::{images, prelude::*};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, FromQueryResult, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

pub type ImageRecord = images::Model;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// Listing projection of a stored image, without the payload
#[derive(Debug, Clone, PartialEq, Serialize, FromQueryResult, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub id: i32,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// Durable storage for detected images
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Store one detected image and return its id
    async fn persist(&self, data: &[u8], content_type: &str, label: &str)
    -> Result<i32, StoreError>;

    async fn fetch_latest(&self) -> Result<Option<ImageRecord>, StoreError>;

    async fn fetch_by_id(&self, id: i32) -> Result<Option<ImageRecord>, StoreError>;

    /// Oldest first
    async fn list_summaries(&self) -> Result<Vec<ImageSummary>, StoreError>;
}

pub struct SeaOrmImageStore {
    db: DatabaseConnection,
}

impl SeaOrmImageStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ImageStore for SeaOrmImageStore {
    async fn persist(
        &self,
        data: &[u8],
        content_type: &str,
        label: &str,
    ) -> Result<i32, StoreError> {
        let record = images::ActiveModel {
            data: Set(data.to_vec()),
            content_type: Set(content_type.to_string()),
            label: Set(label.to_string()),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        Ok(record.id)
    }

    async fn fetch_latest(&self) -> Result<Option<ImageRecord>, StoreError> {
        let latest = Images::find()
            .order_by_desc(images::Column::CreatedAt)
            .order_by_desc(images::Column::Id)
            .one(&self.db)
            .await?;
        Ok(latest)
    }

    async fn fetch_by_id(&self, id: i32) -> Result<Option<ImageRecord>, StoreError> {
        Ok(Images::find_by_id(id).one(&self.db).await?)
    }

    async fn list_summaries(&self) -> Result<Vec<ImageSummary>, StoreError> {
        let summaries = Images::find()
            .select_only()
            .column(images::Column::Id)
            .column(images::Column::Label)
            .column(images::Column::CreatedAt)
            .order_by_asc(images::Column::CreatedAt)
            .order_by_asc(images::Column::Id)
            .into_model::<ImageSummary>()
            .all(&self.db)
            .await?;
        Ok(summaries)
    }
}
