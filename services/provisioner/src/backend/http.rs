//! JSON gateway client for the provider API.
//!
//! Endpoints (relative to the base URL):
//! - `POST /v1/resources/describe` - list resources matching a filter
//! - `POST /v1/resources` - create a resource
//! - `POST /v1/resources/{id}/attachments` - attach to a node
//! - `PUT /v1/resources/{id}/tags` - merge tags
//! - `DELETE /v1/resources/{id}` - delete
//! - `GET|PUT /v1/nodes/{id}/tags` - the node's own tags

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zoneclaim_id::{AttachmentId, NodeId, ResourceId};

use super::{BackendError, ResourceBackend};
use crate::model::{CreateRequest, ResourceDescriptor, ResourceFilter};

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Serialize)]
struct AttachRequest<'a> {
    node_id: &'a NodeId,
}

#[derive(Debug, Deserialize)]
struct AttachResponse {
    attachment_id: AttachmentId,
}

#[derive(Debug, Serialize, Deserialize)]
struct TagsBody {
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct TagsRef<'a> {
    tags: &'a BTreeMap<String, String>,
}

/// Provider gateway client.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client. `timeout` bounds each request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response, what: &str) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = %status, body = %body, "{} failed", what);
        let detail = format!("{what}: {status} - {body}");
        Err(match status {
            StatusCode::NOT_FOUND => BackendError::NotFound(detail),
            StatusCode::CONFLICT => BackendError::Conflict(detail),
            StatusCode::TOO_MANY_REQUESTS => BackendError::Transient(detail),
            s if s.is_server_error() => BackendError::Transient(detail),
            _ => BackendError::Invalid(detail),
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        response.json().await.map_err(map_reqwest)
    }
}

fn map_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::Invalid(format!("malformed response: {err}"))
    } else {
        BackendError::Transient(err.to_string())
    }
}

#[async_trait]
impl ResourceBackend for HttpBackend {
    async fn describe(&self, filter: &ResourceFilter) -> Result<Vec<ResourceDescriptor>, BackendError> {
        let url = self.url("/v1/resources/describe");
        debug!(url = %url, "Describing resources");

        let response = self
            .client
            .post(&url)
            .json(filter)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = Self::check(response, "describe resources").await?;
        let body: DescribeResponse = Self::decode(response).await?;
        Ok(body.resources)
    }

    async fn create(&self, request: &CreateRequest) -> Result<ResourceDescriptor, BackendError> {
        let url = self.url("/v1/resources");
        debug!(kind = %request.kind(), zone = %request.zone, "Creating resource");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = Self::check(response, "create resource").await?;
        Self::decode(response).await
    }

    async fn attach(&self, resource: &ResourceId, node: &NodeId) -> Result<AttachmentId, BackendError> {
        let url = self.url(&format!("/v1/resources/{resource}/attachments"));
        debug!(resource_id = %resource, node_id = %node, "Attaching resource");

        let response = self
            .client
            .post(&url)
            .json(&AttachRequest { node_id: node })
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = Self::check(response, "attach resource").await?;
        let body: AttachResponse = Self::decode(response).await?;
        Ok(body.attachment_id)
    }

    async fn set_tags(
        &self,
        resource: &ResourceId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let url = self.url(&format!("/v1/resources/{resource}/tags"));

        let response = self
            .client
            .put(&url)
            .json(&TagsRef { tags })
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::check(response, "set resource tags").await?;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceId) -> Result<(), BackendError> {
        let url = self.url(&format!("/v1/resources/{resource}"));
        debug!(resource_id = %resource, "Deleting resource");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::check(response, "delete resource").await?;
        Ok(())
    }

    async fn node_tags(&self, node: &NodeId) -> Result<BTreeMap<String, String>, BackendError> {
        let url = self.url(&format!("/v1/nodes/{node}/tags"));

        let response = self.client.get(&url).send().await.map_err(map_reqwest)?;
        let response = Self::check(response, "read node tags").await?;
        let body: TagsBody = Self::decode(response).await?;
        Ok(body.tags)
    }

    async fn set_node_tags(
        &self,
        node: &NodeId,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), BackendError> {
        let url = self.url(&format!("/v1/nodes/{node}/tags"));

        let response = self
            .client
            .put(&url)
            .json(&TagsRef { tags })
            .send()
            .await
            .map_err(map_reqwest)?;
        Self::check(response, "set node tags").await?;
        Ok(())
    }
}
