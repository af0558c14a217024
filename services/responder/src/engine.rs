//! Registry of managed taps.
//!
//! The engine owns the index -> [`TapHandle`] map. Every added tap runs in its
//! own task; when that task ends, for whatever reason, it removes its own
//! entry. Registry operations never wait on a running tap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::AdvertisementConfig;
use crate::error::TapError;
use crate::kernel::{LinkResolver, RouteInspector};
use crate::tap::{TapExit, TapHandle};
use crate::transport::Dialer;

/// How often [`Engine::shutdown`] checks for finished tasks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Handle to the tap registry. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    taps: RwLock<HashMap<u32, Arc<TapHandle>>>,
    running: AtomicUsize,
    resolver: Arc<dyn LinkResolver>,
    inspector: Arc<dyn RouteInspector>,
    dialer: Arc<dyn Dialer>,
    config: AdvertisementConfig,
}

impl Engine {
    pub fn new(
        resolver: Arc<dyn LinkResolver>,
        inspector: Arc<dyn RouteInspector>,
        dialer: Arc<dyn Dialer>,
        config: AdvertisementConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                taps: RwLock::new(HashMap::new()),
                running: AtomicUsize::new(0),
                resolver,
                inspector,
                dialer,
                config,
            }),
        }
    }

    /// Construct a tap for `if_index`, register it and start advertising.
    ///
    /// Construction failures are logged and returned; the index stays
    /// unregistered. Adding an index that is already registered replaces the
    /// old handle and cancels it.
    pub async fn add(&self, if_index: u32) -> Result<(), TapError> {
        let tap = match TapHandle::construct(
            if_index,
            self.inner.resolver.as_ref(),
            self.inner.inspector.as_ref(),
        )
        .await
        {
            Ok(tap) => Arc::new(tap),
            Err(e) if e.is_ineligible() => {
                info!(if_index, reason = %e, "Skipping interface");
                return Err(e);
            }
            Err(e) => {
                warn!(if_index, error = %e, "Failed to construct tap");
                return Err(e);
            }
        };

        let replaced = self
            .inner
            .taps
            .write()
            .await
            .insert(if_index, Arc::clone(&tap));
        if let Some(old) = replaced {
            warn!(if_index, interface = %old.name(), "Replacing registered tap");
            old.cancel();
        }

        info!(
            if_index,
            interface = %tap.name(),
            hardware_addr = %tap.link().hardware_addr_string(),
            "Added tap"
        );

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let engine = self.clone();
        tokio::spawn(async move { engine.run(tap).await });

        Ok(())
    }

    async fn run(self, tap: Arc<TapHandle>) {
        let exit = tap
            .listen(self.inner.dialer.as_ref(), &self.inner.config)
            .await;

        match exit {
            TapExit::Canceled => info!(interface = %tap.name(), "Tap closed"),
            TapExit::Failed(e) => error!(interface = %tap.name(), error = %e, "Tap failed"),
        }

        {
            let mut taps = self.inner.taps.write().await;
            // A later add may have replaced this handle; leave that one alone.
            if taps
                .get(&tap.index())
                .is_some_and(|current| Arc::ptr_eq(current, &tap))
            {
                taps.remove(&tap.index());
            }
        }

        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether `if_index` is registered.
    pub async fn check(&self, if_index: u32) -> bool {
        self.inner.taps.read().await.contains_key(&if_index)
    }

    /// The registered handle for `if_index`, if any.
    pub async fn get(&self, if_index: u32) -> Option<Arc<TapHandle>> {
        self.inner.taps.read().await.get(&if_index).cloned()
    }

    /// Cancel and deregister `if_index`. No-op when absent.
    pub async fn close(&self, if_index: u32) {
        let removed = self.inner.taps.write().await.remove(&if_index);
        if let Some(tap) = removed {
            tap.cancel();
            info!(if_index, interface = %tap.name(), "Closing tap");
        }
    }

    /// Number of registered taps.
    pub async fn len(&self) -> usize {
        self.inner.taps.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.taps.read().await.is_empty()
    }

    /// Registered indices, ascending.
    pub async fn indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.inner.taps.read().await.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Number of tap tasks still running, registered or not.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Cancel every tap and wait up to `grace` for their tasks to finish.
    ///
    /// Returns `true` when every task finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        {
            let taps = self.inner.taps.read().await;
            info!(count = taps.len(), "Stopping all taps");
            for tap in taps.values() {
                tap.cancel();
            }
        }

        let deadline = Instant::now() + grace;
        while self.running() > 0 {
            if Instant::now() >= deadline {
                warn!(remaining = self.running(), "Taps still running after grace period");
                return false;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        info!("All taps stopped");
        true
    }
}
