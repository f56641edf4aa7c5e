//! Thin client for the (out-of-scope) REST layer: engagement action posts,
//! canonical aggregate reads, and cursor-paginated feed pages. Errors use
//! the uniform `{ error, code }` body with the status carrying the category.

use async_trait::async_trait;
use engage_proto::{ActionKind, Aggregate, ErrorBody, FeedPageResponse};
use reqwest::StatusCode;

use crate::controller::AggregateReader;
use crate::error::EngageError;
use crate::feed::PageFetcher;

#[derive(Clone)]
pub struct EngageApi {
    http: reqwest::Client,
    base: String,
}

impl EngageApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /resource/{id}/{action}`: returns the created sub-resource,
    /// or `None` when the server sends no body.
    pub async fn post_action(
        &self,
        entity_id: &str,
        action: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, EngageError> {
        let url = format!("{}/resource/{}/{}", self.base, entity_id, action);
        let mut request = self.http.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = check(request.send().await?).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EngageError::Decode(e.to_string()))
    }

    /// `DELETE /resource/{id}/{action}`: idempotent removal; deleting an
    /// already-removed record is the server's call, not ours.
    pub async fn delete_action(&self, entity_id: &str, action: &str) -> Result<(), EngageError> {
        let url = format!("{}/resource/{}/{}", self.base, entity_id, action);
        check(self.http.delete(&url).send().await?).await?;
        Ok(())
    }

    /// `GET /resource/{id}/{action}-info`: canonical aggregate snapshot
    /// used to overwrite optimistic numbers after a mutating call.
    pub async fn action_info(&self, entity_id: &str, action: &str) -> Result<Aggregate, EngageError> {
        let url = format!("{}/resource/{}/{}-info", self.base, entity_id, action);
        let response = check(self.http.get(&url).send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| EngageError::Decode(e.to_string()))
    }

    /// `GET /{filter}?cursor=&limit=`: one feed page.
    pub async fn feed_page(
        &self,
        filter_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FeedPageResponse, EngageError> {
        let url = format!("{}/{}", self.base, filter_key.trim_start_matches('/'));
        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let response = check(self.http.get(&url).query(&query).send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| EngageError::Decode(e.to_string()))
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, EngageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.json::<ErrorBody>().await.ok();
    Err(EngageError::from_status(status.as_u16(), body))
}

#[async_trait]
impl AggregateReader for EngageApi {
    async fn canonical_aggregate(
        &self,
        entity_id: &str,
        kind: ActionKind,
    ) -> Result<Aggregate, EngageError> {
        self.action_info(entity_id, kind.action_path()).await
    }
}

#[async_trait]
impl PageFetcher for EngageApi {
    async fn fetch_page(
        &self,
        filter_key: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<FeedPageResponse, EngageError> {
        self.feed_page(filter_key, cursor, limit).await
    }
}
