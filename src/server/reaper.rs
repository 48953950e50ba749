use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::server::service::StoreService;
use crate::store::LocalStore;

/// Periodically aborts transactions that outlived their own timeout or the
/// server timeout, whichever is shorter.
///
/// A transaction is reaped only while no call holds it in use. Removal from
/// the registry happens before the store abort, so a concurrent outcome call
/// sees `TransactionNotActive` instead of racing the reaper.
pub struct Reaper<S> {
    service: Arc<StoreService<S>>,
    delay: Duration,
    timeout: Duration,
}

impl<S: LocalStore> Reaper<S> {
    pub fn new(service: Arc<StoreService<S>>, delay: Duration, timeout: Duration) -> Self {
        Self {
            service,
            delay,
            timeout,
        }
    }

    /// Sweeps every `delay` until the token is cancelled.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut ticks = interval(self.delay);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    self.sweep().await;
                }
                _ = cancel_token.cancelled() => {
                    debug!("reaper stopped");
                    return;
                }
            }
        }
    }

    /// Aborts every expired idle transaction. Returns how many were reaped.
    pub async fn sweep(&self) -> usize {
        let registry = self.service.registry();
        let mut reaped = 0;

        for txn in registry.scan_expired(Instant::now(), self.timeout) {
            // It may have been leased or finished since the scan.
            let Some(txn) = registry.remove_if_idle(txn.tid()) else {
                continue;
            };
            match self.service.store().abort(&txn).await {
                Ok(()) | Err(StoreError::TransactionNotActive(_)) => {
                    info!(tid = %txn.tid(), "reaped expired transaction");
                    reaped += 1;
                }
                Err(e) => {
                    warn!(tid = %txn.tid(), error = %e, "failed to abort expired transaction");
                }
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ObjectId;

    fn service() -> Arc<StoreService<MemoryStore>> {
        Arc::new(StoreService::new(
            Arc::new(MemoryStore::new()),
            10,
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_transactions() {
        let service = service();
        let tid = service.create_transaction(1000).await.unwrap();
        service.set_object(tid, ObjectId::new(1), vec![1]).await.unwrap();

        let reaper = Reaper::new(service.clone(), Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(reaper.sweep().await, 1);
        assert!(!service.registry().contains(tid));
        assert_eq!(service.store().live_transactions(), 0);
        assert!(matches!(
            service.commit(tid).await,
            Err(StoreError::TransactionNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_honors_transaction_timeout() {
        let service = service();
        let short = service.create_transaction(50).await.unwrap();
        let long = service.create_transaction(60_000).await.unwrap();
        service.set_object(short, ObjectId::new(5), vec![1]).await.unwrap();

        let reaper = Reaper::new(service.clone(), Duration::from_millis(10), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reaper.sweep().await, 1);
        assert!(!service.registry().contains(short));
        assert!(service.registry().contains(long));
        service.set_object(long, ObjectId::new(5), vec![2]).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_transaction_fails_before_reaping() {
        let service = service();
        let tid = service.create_transaction(20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            service.get_object(tid, ObjectId::new(1), false).await,
            Err(StoreError::TransactionTimeout(_))
        ));
        assert!(!service.registry().contains(tid));
    }

    #[tokio::test]
    async fn test_sweep_skips_young_transactions() {
        let service = service();
        let tid = service.create_transaction(1000).await.unwrap();

        let reaper = Reaper::new(service.clone(), Duration::from_millis(10), Duration::from_secs(60));
        assert_eq!(reaper.sweep().await, 0);
        assert!(service.registry().contains(tid));
    }

    #[tokio::test]
    async fn test_sweep_skips_transactions_in_use() {
        let service = service();
        let tid = service.create_transaction(1000).await.unwrap();
        let lease = service.registry().get(tid).unwrap();

        let reaper = Reaper::new(service.clone(), Duration::from_millis(10), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(reaper.sweep().await, 0);

        drop(lease);
        assert_eq!(reaper.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let reaper = Reaper::new(service(), Duration::from_millis(10), Duration::from_secs(60));
        let token = CancellationToken::new();
        let handle = tokio::spawn(reaper.run(token.clone()));
        token.cancel();
        handle.await.unwrap();
    }
}
