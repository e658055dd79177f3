//! Registry Client: low-level calls to the naming registry (spec §4.A).

use crate::error::ClientError;
use crate::instance::{Instance, ServiceTarget};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const LIST_PATH: &str = "/nacos/v2/ns/instance/list";
const INSTANCE_PATH: &str = "/nacos/v2/ns/instance";

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: InstanceListData,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceListData {
    #[serde(default)]
    hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct Host {
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

/// Low-level HTTP client for the naming registry. One instance is created per process
/// and shared across pollers (spec §5, "initialize-once discipline").
pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `GET .../instance/list?serviceName=...&groupName=...[&namespaceId=...][&clusterName=...]&healthyOnly=false`
    pub async fn list_instances(
        &self,
        target: &ServiceTarget,
        attempt_timeout: Duration,
    ) -> Result<Vec<Instance>, ClientError> {
        let url = format!("{}{}", target.registry_addr, LIST_PATH);

        let mut request = self
            .http
            .get(&url)
            .timeout(attempt_timeout)
            .query(&[("serviceName", target.service_name.as_str()), ("groupName", target.group.as_str())]);

        if !target.namespace_id.is_empty() {
            request = request.query(&[("namespaceId", target.namespace_id.as_str())]);
        }
        if let Some(cluster) = target.clusters.first() {
            request = request.query(&[("clusterName", cluster.as_str())]);
        }
        request = request.query(&[("healthyOnly", "false")]);

        if let (Some(user), Some(pass)) = (&target.username, &target.password) {
            if !user.is_empty() && !pass.is_empty() {
                request = request.basic_auth(user, Some(pass));
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::RegistryUnavailable(e.to_string()))?;

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::RegistryUnavailable(e.to_string()))?;

        let parsed: InstanceListResponse =
            serde_json::from_str(&body).map_err(|e| ClientError::ProtocolError(e.to_string()))?;

        if parsed.code != 0 {
            return Err(ClientError::RegistryError { code: parsed.code, message: parsed.message });
        }

        Ok(parsed
            .data
            .hosts
            .into_iter()
            .map(|h| Instance {
                address: format!("{}:{}", h.ip, h.port),
                weight: h.weight,
                healthy: h.healthy,
                enabled: h.enabled,
                metadata: h.metadata,
            })
            .collect())
    }

    /// Ephemeral registration; the registry purges the entry if heartbeats stop.
    pub async fn register(&self, target: &ServiceTarget, instance: &Instance) -> Result<(), ClientError> {
        let url = format!("{}{}", target.registry_addr, INSTANCE_PATH);
        let (ip, port) = split_address(&instance.address)?;

        let response = self
            .http
            .post(&url)
            .query(&registration_params(target, &ip, port, instance))
            .send()
            .await
            .map_err(|e| ClientError::RegistryUnavailable(e.to_string()))?;

        ensure_success(response).await
    }

    /// Idempotent: deregistering an absent entry is not an error.
    pub async fn deregister(&self, target: &ServiceTarget, instance: &Instance) -> Result<(), ClientError> {
        let url = format!("{}{}", target.registry_addr, INSTANCE_PATH);
        let (ip, port) = split_address(&instance.address)?;

        let response = self
            .http
            .delete(&url)
            .query(&registration_params(target, &ip, port, instance))
            .send()
            .await
            .map_err(|e| ClientError::RegistryUnavailable(e.to_string()))?;

        match ensure_success(response).await {
            Ok(()) => Ok(()),
            Err(ClientError::HttpError { status: 404, .. }) => Ok(()),
            Err(other) => Err(other),
        }
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::HttpError { status: status.as_u16(), body })
}

fn registration_params<'a>(
    target: &'a ServiceTarget,
    ip: &'a str,
    port: u16,
    instance: &'a Instance,
) -> Vec<(&'static str, String)> {
    vec![
        ("serviceName", target.service_name.clone()),
        ("groupName", target.group.clone()),
        ("ip", ip.to_string()),
        ("port", port.to_string()),
        ("weight", instance.weight.to_string()),
        ("enabled", instance.enabled.to_string()),
        ("healthy", instance.healthy.to_string()),
        ("ephemeral", "true".to_string()),
        ("clusterName", target.clusters.first().cloned().unwrap_or_default()),
    ]
}

fn split_address(address: &str) -> Result<(String, u16), ClientError> {
    let (ip, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ClientError::ConfigInvalid(format!("malformed address: {}", address)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ClientError::ConfigInvalid(format!("malformed port in address: {}", address)))?;
    Ok((ip.to_string(), port))
}
