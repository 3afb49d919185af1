//! Control-plane API client.
//!
//! The validator only needs a handful of calls on the control plane's
//! resource API: create, read, search and delete resources, and invoke
//! named operations (reboot, decommission, update, ...) that answer with a
//! job to poll.

use std::time::Duration;

use async_trait::async_trait;
use edgeval_id::{IdError, ResourceId};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error};

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("control plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("{resource} has no field '{field}'")]
    MissingField { resource: String, field: String },

    #[error("control plane returned an invalid resource id: {0}")]
    InvalidId(#[from] IdError),
}

/// A resource document with accessors for the fields the validator reads.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource(Value);

impl Resource {
    pub fn new(document: Value) -> Self {
        Self(document)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    /// Lifecycle state (`NEW`, `ACTIVATED`, ...).
    pub fn state(&self) -> Option<&str> {
        self.str_field("state")
    }

    /// Engine-reported status (`OPERATIONAL`, ...).
    pub fn status(&self) -> Option<&str> {
        self.str_field("status")
    }

    /// Id of the edge's status resource.
    pub fn status_resource(&self) -> Option<&str> {
        self.str_field("nuvlabox-status")
    }

    pub fn engine_version(&self) -> Option<&str> {
        self.str_field("nuvlabox-engine-version")
    }

    pub fn installation_parameters(&self) -> Option<&Value> {
        self.field("installation-parameters")
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.field("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn online(&self) -> Option<bool> {
        self.field("online").and_then(Value::as_bool)
    }

    pub fn into_inner(self) -> Value {
        self.0
    }
}

/// Answer to a create or an operation call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OperationResponse {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: Option<String>,
    /// Id of the job tracking an operation.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, rename = "resource-id")]
    pub resource_id: Option<String>,
}

impl OperationResponse {
    /// The job started by the operation, if any.
    pub fn job(&self) -> Option<ResourceId> {
        self.location.as_deref().and_then(|l| ResourceId::parse(l).ok())
    }
}

/// The control plane, as seen by the validator.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a resource in `collection`.
    async fn add(&self, collection: &str, body: &Value) -> Result<ResourceId, ControlPlaneError>;

    /// Read a resource, optionally only some fields.
    async fn get(&self, id: &ResourceId, select: Option<&[&str]>)
        -> Result<Resource, ControlPlaneError>;

    /// Resources of `collection` matching a filter expression.
    async fn search(&self, collection: &str, filter: &str)
        -> Result<Vec<Resource>, ControlPlaneError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), ControlPlaneError>;

    /// Invoke a named operation on a resource.
    async fn operation(
        &self,
        id: &ResourceId,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<OperationResponse, ControlPlaneError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    resources: Vec<Value>,
}

/// HTTP client of the Nuvla API, with a cookie session.
pub struct NuvlaClient {
    client: reqwest::Client,
    base_url: String,
}

impl NuvlaClient {
    /// Create a client for `endpoint` (e.g. `https://nuvla.io`).
    pub fn new(endpoint: &str) -> Result<Self, ControlPlaneError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .cookie_store(true)
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/api", endpoint.trim_end_matches('/')),
        })
    }

    /// Open a session with API key credentials.
    pub async fn login_api_key(&self, key: &str, secret: &str) -> Result<(), ControlPlaneError> {
        let url = format!("{}/session", self.base_url);
        debug!(url = %url, "Logging in with API key");

        let body = json!({
            "template": {
                "href": "session-template/api-key",
                "key": key,
                "secret": secret,
            }
        });
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response, "log in").await?;
        Ok(())
    }

    async fn check(
        response: reqwest::Response,
        action: &str,
    ) -> Result<reqwest::Response, ControlPlaneError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        error!(status, body = %body, "Failed to {action}");
        Err(ControlPlaneError::Api { status, body })
    }
}

#[async_trait]
impl ControlPlane for NuvlaClient {
    async fn add(&self, collection: &str, body: &Value) -> Result<ResourceId, ControlPlaneError> {
        let url = format!("{}/{collection}", self.base_url);
        debug!(url = %url, "Creating resource");

        let response = self.client.post(&url).json(body).send().await?;
        let created: OperationResponse = Self::check(response, "create resource").await?.json().await?;

        let id = created
            .resource_id
            .ok_or_else(|| ControlPlaneError::MissingField {
                resource: collection.to_string(),
                field: "resource-id".to_string(),
            })?;
        Ok(ResourceId::parse(&id)?)
    }

    async fn get(
        &self,
        id: &ResourceId,
        select: Option<&[&str]>,
    ) -> Result<Resource, ControlPlaneError> {
        let url = format!("{}/{id}", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(fields) = select {
            request = request.query(&[("select", fields.join(","))]);
        }

        let response = request.send().await?;
        let document: Value = Self::check(response, "get resource").await?.json().await?;
        Ok(Resource::new(document))
    }

    async fn search(
        &self,
        collection: &str,
        filter: &str,
    ) -> Result<Vec<Resource>, ControlPlaneError> {
        let url = format!("{}/{collection}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("filter", filter)])
            .send()
            .await?;
        let found: SearchResponse = Self::check(response, "search resources").await?.json().await?;
        Ok(found.resources.into_iter().map(Resource::new).collect())
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ControlPlaneError> {
        let url = format!("{}/{id}", self.base_url);
        debug!(url = %url, "Deleting resource");
        let response = self.client.delete(&url).send().await?;
        Self::check(response, "delete resource").await?;
        Ok(())
    }

    async fn operation(
        &self,
        id: &ResourceId,
        name: &str,
        payload: Option<&Value>,
    ) -> Result<OperationResponse, ControlPlaneError> {
        let url = format!("{}/{id}/{name}", self.base_url);
        debug!(url = %url, "Invoking operation");

        let empty = json!({});
        let response = self
            .client
            .post(&url)
            .json(payload.unwrap_or(&empty))
            .send()
            .await?;
        Ok(Self::check(response, "invoke operation").await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_accessors() {
        let resource = Resource::new(json!({
            "id": "nuvlabox-status/5d4c0c1e-8e0a-4a55-9b0e-0d2b7a1f3c11",
            "status": "OPERATIONAL",
            "capabilities": ["NUVLA_JOB_PULL", "NUVLA_HEARTBEAT", 3],
            "online": true,
            "nuvlabox-engine-version": "2.4.3",
            "installation-parameters": null,
        }));

        assert_eq!(resource.status(), Some("OPERATIONAL"));
        assert_eq!(resource.capabilities(), vec!["NUVLA_JOB_PULL", "NUVLA_HEARTBEAT"]);
        assert_eq!(resource.online(), Some(true));
        assert_eq!(resource.engine_version(), Some("2.4.3"));
        assert!(resource.installation_parameters().is_none());
        assert!(resource.state().is_none());
    }

    #[test]
    fn test_operation_job() {
        let response: OperationResponse = serde_json::from_value(json!({
            "status": 202,
            "message": "starting nuvlabox/x reboot with async job/1",
            "location": "job/0b3d1c52-7f0e-4f8c-9a55-1e2d3c4b5a69",
        }))
        .unwrap();

        let job = response.job().unwrap();
        assert_eq!(job.collection(), "job");
    }
}
