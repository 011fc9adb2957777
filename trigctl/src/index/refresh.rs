//! Debounced index refresh plus the unconditional background ticker.
//!
//! CRUD mutations and permission revocations call
//! [`RefreshHandle::request_refresh`]; requests landing within the debounce
//! window coalesce into a single rebuild. Independently, a ticker rebuilds
//! on a fixed interval so the index converges even if a refresh request is
//! ever lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TriggerIndex;

/// Capacity of the refresh request channel. Requests are coalesced, so a
/// full channel just means a rebuild is already pending.
const REFRESH_QUEUE: usize = 16;

/// Cheap, cloneable handle for requesting a debounced rebuild.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<()>,
}

impl RefreshHandle {
    /// Request a rebuild. Never blocks; a pending rebuild absorbs the
    /// request.
    pub fn request_refresh(&self) {
        let _ = self.tx.try_send(());
    }
}

pub fn refresh_channel() -> (RefreshHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(REFRESH_QUEUE);
    (RefreshHandle { tx }, rx)
}

/// Drive the index: debounce explicit refresh requests and tick the
/// unconditional rebuild interval. Runs until the token is cancelled.
pub async fn run_refresher(
    index: Arc<TriggerIndex>,
    mut rx: mpsc::Receiver<()>,
    debounce: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Index refresher shutting down");
                return;
            }
            _ = ticker.tick() => {
                rebuild(&index, "interval").await;
            }
            Some(()) = rx.recv() => {
                // Coalesce every request that lands inside the window.
                let deadline = tokio::time::sleep(debounce);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("Index refresher shutting down");
                            return;
                        }
                        _ = &mut deadline => break,
                        Some(()) = rx.recv() => {
                            debug!("Coalescing index refresh request");
                        }
                    }
                }
                rebuild(&index, "request").await;
                ticker.reset();
            }
        }
    }
}

async fn rebuild(index: &TriggerIndex, cause: &'static str) {
    if let Err(e) = index.rebuild().await {
        // Keep serving the previous snapshot; the ticker will try again.
        warn!(cause, error = %e, "Webhook index rebuild failed");
    } else {
        debug!(cause, "Webhook index refreshed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SignalCatalog;
    use crate::test_utils::MemoryTriggerStore;

    fn index_with_counter() -> (Arc<TriggerIndex>, Arc<MemoryTriggerStore>) {
        let store = Arc::new(MemoryTriggerStore::new());
        let catalog = Arc::new(SignalCatalog::load_embedded().unwrap());
        (Arc::new(TriggerIndex::new(store.clone(), catalog)), store)
    }

    /// Let the refresher task run through its ready awaits.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_requests_causes_one_rebuild() {
        let (index, store) = index_with_counter();
        let (handle, rx) = refresh_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_refresher(
            index,
            rx,
            Duration::from_secs(5),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        // Five requests inside two seconds.
        for _ in 0..5 {
            handle.request_refresh();
            tokio::time::advance(Duration::from_millis(400)).await;
        }
        settle().await;
        assert_eq!(store.list_calls(), 0, "nothing rebuilds inside the window");

        // The window closes five seconds after the first request.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(store.list_calls(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn separated_requests_rebuild_separately() {
        let (index, store) = index_with_counter();
        let (handle, rx) = refresh_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_refresher(
            index,
            rx,
            Duration::from_secs(1),
            Duration::from_secs(600),
            shutdown.clone(),
        ));

        handle.request_refresh();
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(store.list_calls(), 1);

        handle.request_refresh();
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(store.list_calls(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn background_ticker_rebuilds_unconditionally() {
        let (index, store) = index_with_counter();
        let (_handle, rx) = refresh_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_refresher(
            index,
            rx,
            Duration::from_secs(5),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(store.list_calls(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(store.list_calls(), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_refresher() {
        let (index, _store) = index_with_counter();
        let (handle, rx) = refresh_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_refresher(
            index,
            rx,
            Duration::from_secs(5),
            Duration::from_secs(60),
            shutdown.clone(),
        ));

        handle.request_refresh();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("refresher should exit promptly")
            .unwrap();
    }
}
