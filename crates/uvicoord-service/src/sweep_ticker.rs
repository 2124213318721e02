use std::{sync::Arc, time::Duration};

use uvicoord_core::Registry;

/// Periodically reclaims ports of instances whose process died.
#[derive(Clone)]
pub struct SweepTicker {
    registry: Arc<Registry>,
    interval: Duration,
}

impl SweepTicker {
    pub fn new(registry: Arc<Registry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) -> usize {
        let reclaimed = self.registry.sweep(None).await;
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "periodic sweep reclaimed ports");
        }
        reclaimed.len()
    }
}
