//! Exponential-backoff retry loop for storage engines that failed to connect
//! at all. Distinct from the heartbeat path, which covers engines that were
//! connected and went silent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pq_common::{global_metrics, EngineConfig, Result};
use pq_model::{AdapterRegistry, EngineSpec, StorageGateway};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ReconnectionScheduler {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl ReconnectionScheduler {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_initial_backoff_ms.max(1)),
            max: Duration::from_millis(config.reconnect_max_backoff_ms.max(1)),
            multiplier: config.reconnect_backoff_multiplier.max(2),
        }
    }

    /// Retry `connect` until it succeeds, sleeping between attempts with
    /// exponentially growing delays capped at the configured maximum.
    pub async fn run_until_connected<F, Fut, T>(&self, storage: &str, mut connect: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.initial;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            global_metrics().inc_reconnect_attempt(storage);
            match connect().await {
                Ok(connected) => {
                    info!(storage, attempt, "storage engine connected");
                    return connected;
                }
                Err(err) => {
                    warn!(
                        storage,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "connect attempt failed; backing off"
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * self.multiplier).min(self.max);
        }
    }

    /// Background variant: keep building the engine's adapter from the
    /// registry and hand the gateway to `on_connected` once it comes up.
    pub fn spawn_connect(
        &self,
        registry: Arc<AdapterRegistry>,
        spec: EngineSpec,
        on_connected: impl FnOnce(Arc<StorageGateway>) + Send + 'static,
    ) -> JoinHandle<()> {
        let scheduler = *self;
        tokio::spawn(async move {
            let storage = spec.id.to_string();
            let adapter = scheduler
                .run_until_connected(&storage, || {
                    let result = registry.build(&spec);
                    async move { result }
                })
                .await;
            on_connected(Arc::new(StorageGateway::new(spec.id, adapter)));
        })
    }
}
