//! REST collaborator. The engine only needs two opaque calls: a
//! full-entity-list fetch for the refresh coordinator and a status
//! mutation for the optimistic flow.

use async_trait::async_trait;
use serde::Serialize;

use opswire_proto::EntitySnapshot;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected request with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait EntityApi: Send + Sync {
    /// Authoritative full-list fetch.
    async fn fetch_all(&self) -> Result<Vec<EntitySnapshot>, ApiError>;

    /// Ask the server to move one entity to a new status.
    async fn set_status(&self, entity_id: &str, status: &str) -> Result<(), ApiError>;
}

/// JSON-over-HTTP implementation against the dashboard backend.
pub struct RestApi {
    http: reqwest::Client,
    base_url: String,
    collection: String,
}

#[derive(Serialize)]
struct StatusPatch<'a> {
    status: &'a str,
}

impl RestApi {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, self.collection)
    }

    fn entity_url(&self, entity_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.collection, entity_id)
    }
}

#[async_trait]
impl EntityApi for RestApi {
    async fn fetch_all(&self) -> Result<Vec<EntitySnapshot>, ApiError> {
        let response = self.http.get(self.collection_url()).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Rejected(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    async fn set_status(&self, entity_id: &str, status: &str) -> Result<(), ApiError> {
        let response = self
            .http
            .patch(self.entity_url(entity_id))
            .json(&StatusPatch { status })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
