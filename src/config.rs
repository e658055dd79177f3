//! Typed registry configuration record (spec §6).
//!
//! Mirrors the original `NacosConf` YAML document: required `ipAddr`/`port`,
//! everything else defaulted the same way the Go struct tags defaulted it.

use crate::error::RegistryConfigError;
use crate::instance::ServiceTarget;
use serde::Deserialize;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    2000
}

fn default_group() -> String {
    "DEFAULT_GROUP".to_string()
}

fn default_namespace_id() -> String {
    "public".to_string()
}

fn default_cluster_name() -> String {
    "DEFAULT".to_string()
}

/// The registry connection record a config loader (external to this crate) materializes
/// from the application's YAML document.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(rename = "ipAddr")]
    pub ip_addr: String,
    pub port: u32,
    #[serde(rename = "timeoutMs", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(rename = "dataID", default)]
    pub data_id: String,
    #[serde(rename = "namespaceID", default = "default_namespace_id")]
    pub namespace_id: String,
    #[serde(rename = "clusterName", default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(rename = "logLevel", default)]
    pub log_level: Option<String>,
    #[serde(rename = "extDataIds", default)]
    pub ext_data_ids: Vec<String>,
}

impl RegistryConfig {
    pub fn registry_base_url(&self) -> String {
        format!("http://{}:{}", self.ip_addr, self.port)
    }

    /// Build an immutable [`ServiceTarget`] for one service, validating required fields.
    pub fn build_target(
        &self,
        service_name: impl Into<String>,
        clusters: Vec<String>,
    ) -> Result<ServiceTarget, RegistryConfigError> {
        if self.ip_addr.is_empty() {
            return Err(RegistryConfigError::EmptyIpAddr);
        }
        if self.port == 0 {
            return Err(RegistryConfigError::InvalidPort(self.port));
        }
        let service_name = service_name.into();
        if service_name.is_empty() {
            return Err(RegistryConfigError::EmptyServiceName);
        }

        let clusters = if clusters.is_empty() { vec![self.cluster_name.clone()] } else { clusters };

        Ok(ServiceTarget {
            service_name,
            registry_addr: self.registry_base_url(),
            group: self.group.clone(),
            namespace_id: self.namespace_id.clone(),
            clusters,
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}
