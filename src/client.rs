//! Service Client facade: wires the registry client, poller, updater, resolver, and
//! dispatcher together for one discovered service (spec §4 overview).

use crate::config::RegistryConfig;
use crate::dispatcher::{Body, CallSpec, RequestDispatcher};
use crate::error::{ClientError, RegistryConfigError};
use crate::instance::{Instance, ServiceTarget};
use crate::pool::BufferPools;
use crate::poller::{DiscoveryPoller, PollerToken};
use crate::registry_client::RegistryClient;
use crate::resolver::AddressResolver;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A fully wired client for one discovered service: owns the resolver, the
/// background poller and updater tasks, and a dispatcher for outbound calls.
///
/// Dropping this value does not stop the background tasks; call [`ServiceClient::close`]
/// to cancel the poller and wait for the updater to drain.
pub struct ServiceClient {
    target: ServiceTarget,
    registry: Arc<RegistryClient>,
    resolver: Arc<AddressResolver>,
    dispatcher: RequestDispatcher,
    poller_token: PollerToken,
    updater_handle: JoinHandle<()>,
    self_instance: Option<Instance>,
}

impl ServiceClient {
    /// Build a client for `service_name` using `config`, register it with the registry
    /// as an ephemeral instance when `self_instance` is provided, and start background
    /// discovery immediately.
    pub async fn connect(
        config: &RegistryConfig,
        service_name: impl Into<String>,
        clusters: Vec<String>,
        self_instance: Option<Instance>,
    ) -> Result<Self, RegistryConfigError> {
        let service_name = service_name.into();
        let target = config.build_target(service_name.clone(), clusters)?;

        let registry = Arc::new(RegistryClient::new());
        let resolver = Arc::new(AddressResolver::new(service_name.clone()));
        let pools = Arc::new(BufferPools::new());

        if let Some(instance) = &self_instance {
            if let Err(err) = registry.register(&target, instance).await {
                tracing::error!(service = %service_name, error = %err, "failed to register self with registry");
            }
        }

        let poller = Arc::new(DiscoveryPoller::new(target.clone(), registry.clone()));
        let (rx, poller_token) = poller.start();
        let updater_handle = crate::updater::spawn(resolver.clone(), rx);

        let dispatcher = RequestDispatcher::new(service_name, resolver.clone(), pools);

        Ok(Self { target, registry, resolver, dispatcher, poller_token, updater_handle, self_instance })
    }

    pub fn service_name(&self) -> &str {
        &self.target.service_name
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    /// A synchronous callback suitable for [`crate::ShutdownCoordinator::add_shutdown_listener`]
    /// that deregisters this client's self-instance from the registry (spec §9, "the
    /// Shutdown Coordinator ... including A's deregister"). A no-op if `connect` was
    /// called without a `self_instance`.
    pub fn deregister_listener(&self) -> impl Fn() + Send + Sync + 'static {
        let registry = self.registry.clone();
        let target = self.target.clone();
        let instance = self.self_instance.clone();
        move || {
            let Some(instance) = instance.clone() else { return };
            let registry = registry.clone();
            let target = target.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle.block_on(async move {
                    if let Err(err) = registry.deregister(&target, &instance).await {
                        tracing::error!(error = %err, "failed to deregister on shutdown");
                    }
                }),
                Err(_) => tracing::error!("no tokio runtime available to deregister on shutdown"),
            }
        }
    }

    pub async fn get(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatcher.get(spec).await
    }

    pub async fn post(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatcher.post(spec).await
    }

    pub async fn put(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatcher.put(spec).await
    }

    pub async fn delete(&self, spec: CallSpec) -> Result<Vec<u8>, ClientError> {
        self.dispatcher.delete(spec).await
    }

    /// Deregisters the self-instance (if any), cancels the discovery poller, and waits
    /// for the updater task to drain and exit.
    pub async fn close(self) {
        if let Some(instance) = &self.self_instance {
            if let Err(err) = self.registry.deregister(&self.target, instance).await {
                tracing::error!(service = %self.target.service_name, error = %err, "failed to deregister on close");
            }
        }

        self.poller_token.cancel();
        if let Err(err) = self.updater_handle.await {
            tracing::error!(service = %self.target.service_name, error = %err, "updater task panicked during close");
        }
    }
}

/// Convenience constructor for a `GET` call with a JSON body omitted.
pub fn get(path: impl Into<String>) -> CallSpec {
    CallSpec::new(path)
}

/// Convenience constructor for a `POST` call carrying a JSON body.
pub fn post_json(path: impl Into<String>, body: serde_json::Value) -> CallSpec {
    CallSpec::new(path).with_body(Body::Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn config_for(registry: &str) -> RegistryConfig {
        let (host, port) = registry
            .trim_start_matches("http://")
            .split_once(':')
            .map(|(h, p)| (h.to_string(), p.parse::<u32>().unwrap()))
            .unwrap();
        RegistryConfig {
            ip_addr: host,
            port,
            timeout_ms: 2000,
            group: "DEFAULT_GROUP".into(),
            data_id: String::new(),
            namespace_id: "public".into(),
            cluster_name: "DEFAULT".into(),
            username: None,
            password: None,
            log_level: None,
            ext_data_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn connect_rejects_invalid_config() {
        let config = RegistryConfig {
            ip_addr: String::new(),
            port: 8848,
            timeout_ms: 2000,
            group: "DEFAULT_GROUP".into(),
            data_id: String::new(),
            namespace_id: "public".into(),
            cluster_name: "DEFAULT".into(),
            username: None,
            password: None,
            log_level: None,
            ext_data_ids: Vec::new(),
        };
        let result = ServiceClient::connect(&config, "orders", vec![], None).await;
        match result {
            Err(err) => assert_eq!(err, RegistryConfigError::EmptyIpAddr),
            Ok(_) => panic!("expected EmptyIpAddr error"),
        }
    }

    #[tokio::test]
    async fn connect_discovers_and_dispatches_end_to_end() {
        let registry = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "ok", "data": { "hosts": [] }
            })))
            .mount(&registry)
            .await;

        let config = config_for(&registry.uri()).await;
        let client = ServiceClient::connect(&config, "orders", vec![], None).await.unwrap();
        assert_eq!(client.service_name(), "orders");

        let err = client.get(get("/widgets")).await.unwrap_err();
        assert!(err.is_no_endpoints());

        client.close().await;
    }

    #[tokio::test]
    async fn connect_registers_self_and_close_deregisters() {
        use std::collections::HashMap;
        use wiremock::matchers::{method, path};

        let registry = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nacos/v2/ns/instance/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "ok", "data": { "hosts": [] }
            })))
            .mount(&registry)
            .await;
        Mock::given(method("POST"))
            .and(path("/nacos/v2/ns/instance"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&registry)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/nacos/v2/ns/instance"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&registry)
            .await;

        let config = config_for(&registry.uri()).await;
        let self_instance = Instance {
            address: "127.0.0.1:9000".into(),
            weight: 1.0,
            healthy: true,
            enabled: true,
            metadata: HashMap::new(),
        };
        let client = ServiceClient::connect(&config, "orders", vec![], Some(self_instance))
            .await
            .unwrap();

        client.close().await;

        let register_hits = registry
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method == wiremock::http::Method::Post)
            .count();
        let deregister_hits = registry
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method == wiremock::http::Method::Delete)
            .count();
        assert_eq!(register_hits, 1);
        assert_eq!(deregister_hits, 1);
    }

    #[tokio::test]
    async fn deregister_listener_is_noop_without_self_instance() {
        let registry = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": 0, "message": "ok", "data": { "hosts": [] }
            })))
            .mount(&registry)
            .await;

        let config = config_for(&registry.uri()).await;
        let client = ServiceClient::connect(&config, "orders", vec![], None).await.unwrap();

        let listener = client.deregister_listener();
        listener();

        let deletes = registry
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method == wiremock::http::Method::Delete)
            .count();
        assert_eq!(deletes, 0);

        client.close().await;
    }
}
