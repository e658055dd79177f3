//! Resolver Updater: drains the discovery poller's publish channel into the resolver (spec §4.D).

use crate::resolver::AddressResolver;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Spawns the single-consumer loop that installs each published endpoint list into
/// `resolver`. Terminates when the channel is closed (the poller was cancelled).
pub fn spawn(resolver: Arc<AddressResolver>, mut rx: mpsc::Receiver<Vec<String>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let service = resolver.get_service_name().to_string();
        tracing::info!(service = %service, "resolver updater started");

        while let Some(endpoints) = rx.recv().await {
            if endpoints.is_empty() {
                tracing::warn!(service = %service, "received empty endpoint list, clearing resolver");
                resolver.clear();
                continue;
            }
            resolver.update_addresses(endpoints);
        }

        tracing::info!(service = %service, "resolver updater stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_publish_clears_resolver() {
        let resolver = Arc::new(AddressResolver::new("orders"));
        resolver.update_addresses(["a:1".to_string()]);

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn(resolver.clone(), rx);

        tx.send(Vec::new()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(resolver.address_count(), 0);
    }

    #[tokio::test]
    async fn nonempty_publish_updates_resolver() {
        let resolver = Arc::new(AddressResolver::new("orders"));
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn(resolver.clone(), rx);

        tx.send(vec!["b:1".to_string(), "a:1".to_string()]).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(resolver.get_addresses(), vec!["a:1", "b:1"]);
    }

    #[tokio::test]
    async fn loop_terminates_when_channel_closes() {
        let resolver = Arc::new(AddressResolver::new("orders"));
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn(resolver, rx);
        drop(tx);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("updater should terminate promptly")
            .unwrap();
    }
}
