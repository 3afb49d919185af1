//! Shared fixtures for the validator integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edgeval_id::{EdgeId, EdgeStatusId, ResourceId};
use edgeval_release::{FixedReleaseIndex, ReleaseSelector, Version};
use edgeval_validator::backend::{Backend, BackendOptions};
use edgeval_validator::certificate::WatcherConfig;
use edgeval_validator::client::{ControlPlane, ControlPlaneError, OperationResponse, Resource};
use edgeval_validator::config::DeviceConfig;
use edgeval_validator::device::{MockTransport, RemoteHost};
use serde_json::{json, Value};

pub const DEVICE_ALIAS: &str = "pi-1";

pub fn host(mock: &MockTransport, backend: &str) -> RemoteHost {
    RemoteHost::new(
        DeviceConfig::new(DEVICE_ALIAS, "10.0.0.5", backend),
        Arc::new(mock.clone()),
    )
}

pub fn options(log_dir: &Path) -> BackendOptions {
    let mut options = BackendOptions::new(
        ReleaseSelector::version(Version::new(2, 4, 3)),
        Arc::new(FixedReleaseIndex::new(Version::new(2, 19, 1))),
    )
    .with_log_dir(log_dir)
    .with_watcher(WatcherConfig {
        join_timeout: Duration::from_secs(2),
        ..WatcherConfig::default()
    });
    options.namespace_attempts = 3;
    options.namespace_interval = Duration::from_millis(10);
    options
}

pub fn backend(mock: &MockTransport, kind: &str, log_dir: &Path) -> Backend {
    Backend::from_device(host(mock, kind), options(log_dir)).unwrap()
}

/// JSON-lines `docker ps` output for the given container names.
pub fn containers(names: &[&str]) -> String {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            format!(r#"{{"ID":"c{i}","Image":"sixsq/nuvlaedge:2.4.3","Names":"{name}"}}"#)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn next<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

#[derive(Debug, Default)]
struct Script {
    states: VecDeque<String>,
    statuses: VecDeque<String>,
    capabilities: VecDeque<Vec<String>>,
    job_states: VecDeque<String>,
    decommissioned: bool,
    fail_delete: bool,
    /// Edge reads answered before every further read fails.
    edge_reads_left: Option<usize>,
    calls: Vec<String>,
    created: Vec<Value>,
}

/// Control plane answering from scripted sequences; the last value repeats.
pub struct ScriptedControlPlane {
    pub edge: EdgeId,
    pub status: EdgeStatusId,
    script: Mutex<Script>,
}

impl ScriptedControlPlane {
    pub fn new() -> Self {
        let script = Script {
            states: VecDeque::from(["NEW".to_string()]),
            statuses: VecDeque::from(["UNKNOWN".to_string()]),
            capabilities: VecDeque::from([vec!["NUVLA_JOB_PULL".to_string()]]),
            job_states: VecDeque::from(["SUCCESS".to_string()]),
            ..Script::default()
        };
        Self {
            edge: EdgeId::new(),
            status: EdgeStatusId::new(),
            script: Mutex::new(script),
        }
    }

    pub fn with_states(self, states: &[&str]) -> Self {
        self.script.lock().unwrap().states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_statuses(self, statuses: &[&str]) -> Self {
        self.script.lock().unwrap().statuses = statuses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_capabilities(self, capabilities: &[&[&str]]) -> Self {
        self.script.lock().unwrap().capabilities = capabilities
            .iter()
            .map(|caps| caps.iter().map(|c| c.to_string()).collect())
            .collect();
        self
    }

    pub fn with_job_states(self, states: &[&str]) -> Self {
        self.script.lock().unwrap().job_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_delete(self) -> Self {
        self.script.lock().unwrap().fail_delete = true;
        self
    }

    /// Answer `reads` edge reads, then fail every later one with a 503.
    pub fn failing_edge_reads_after(self, reads: usize) -> Self {
        self.script.lock().unwrap().edge_reads_left = Some(reads);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn created(&self) -> Vec<Value> {
        self.script.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn add(&self, collection: &str, body: &Value) -> Result<ResourceId, ControlPlaneError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("add {collection}"));
        script.created.push(body.clone());
        Ok(self.edge.to_resource_id())
    }

    async fn get(
        &self,
        id: &ResourceId,
        _select: Option<&[&str]>,
    ) -> Result<Resource, ControlPlaneError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("get {}", id.collection()));

        let document = match id.collection() {
            "nuvlabox" => {
                match script.edge_reads_left.as_mut() {
                    Some(0) => {
                        return Err(ControlPlaneError::Api {
                            status: 503,
                            body: "a,b".to_string(),
                        })
                    }
                    Some(left) => *left -= 1,
                    None => {}
                }
                let state = if script.decommissioned {
                    "DECOMMISSIONED".to_string()
                } else {
                    next(&mut script.states).unwrap_or_default()
                };
                json!({
                    "id": id.to_string(),
                    "state": state,
                    "nuvlabox-status": self.status.to_string(),
                    "capabilities": next(&mut script.capabilities).unwrap_or_default(),
                    "online": true,
                })
            }
            "nuvlabox-status" => json!({
                "id": id.to_string(),
                "status": next(&mut script.statuses),
                "nuvlabox-engine-version": "2.4.3",
            }),
            "job" => json!({ "id": id.to_string(), "state": next(&mut script.job_states) }),
            other => {
                return Err(ControlPlaneError::Api {
                    status: 404,
                    body: format!("{other} not found"),
                })
            }
        };
        Ok(Resource::new(document))
    }

    async fn search(
        &self,
        collection: &str,
        _filter: &str,
    ) -> Result<Vec<Resource>, ControlPlaneError> {
        self.script.lock().unwrap().calls.push(format!("search {collection}"));
        Ok(vec![Resource::new(json!({ "id": format!("{collection}/1") }))])
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ControlPlaneError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("delete {}", id.collection()));
        if script.fail_delete {
            return Err(ControlPlaneError::Api {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(())
    }

    async fn operation(
        &self,
        id: &ResourceId,
        name: &str,
        _payload: Option<&Value>,
    ) -> Result<OperationResponse, ControlPlaneError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(format!("operation {name}"));
        if name == "decommission" {
            script.decommissioned = true;
        }
        Ok(OperationResponse {
            status: 202,
            message: Some(format!("{name} on {id}")),
            location: Some(format!("job/{}", edgeval_id::Uuid::new_v4())),
            resource_id: None,
        })
    }
}
