//! Process-wide cookie state shared by the daemon and every shim instance
//!
//! Callers receive an explicit `SharedHandle` instead of reaching for a global,
//! so tests can build isolated instances. The engine sits behind a reader/writer
//! lock (compute and verify run concurrently, rotation is exclusive) and the
//! cache behind a mutex. No I/O may happen while either guard is held.

use crate::cache::PeerCookieCache;
use crate::engine::StatelessEngine;
use crate::shutdown::ShutdownSignal;
use metrics::counter;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to the attached shared state
pub type SharedHandle = Arc<SharedState>;

#[derive(Debug)]
pub struct SharedState {
    engine: RwLock<StatelessEngine>,
    cache: Mutex<PeerCookieCache>,
}

impl SharedState {
    /// Fresh state with random secrets and an empty cache
    pub fn new(cache_capacity: usize) -> Self {
        Self::with_engine(StatelessEngine::new(), cache_capacity)
    }

    pub fn with_engine(engine: StatelessEngine, cache_capacity: usize) -> Self {
        info!(cache_capacity, "Initialized shared cookie state");
        Self {
            engine: RwLock::new(engine),
            cache: Mutex::new(PeerCookieCache::new(cache_capacity)),
        }
    }

    pub fn into_handle(self) -> SharedHandle {
        Arc::new(self)
    }

    /// Read access to the stateless engine
    pub fn engine(&self) -> RwLockReadGuard<'_, StatelessEngine> {
        match self.engine.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Engine lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn engine_mut(&self) -> RwLockWriteGuard<'_, StatelessEngine> {
        match self.engine.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Engine lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Exclusive access to the peer cache
    pub fn cache(&self) -> MutexGuard<'_, PeerCookieCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Cache mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Rotate the stateless secrets; returns the new epoch
    pub fn rotate(&self) -> u64 {
        let mut engine = self.engine_mut();
        engine.rotate();
        counter!("ipcookie_secret_rotations", 1);
        engine.rotation_epoch()
    }

    /// Start background secret rotation until shutdown
    pub fn spawn_rotation_task(self: Arc<Self>, period: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // After a stall, rotate once and restart the period; catching up
            // would rotate twice in a row and void the PREVIOUS window
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the secrets are already fresh
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let epoch = self.rotate();
                        debug!(epoch, "Scheduled secret rotation done");
                    }
                    _ = shutdown.wait() => {
                        debug!("Rotation task stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Verification;
    use std::net::Ipv6Addr;

    #[test]
    fn test_handles_see_the_same_state() {
        let shared = SharedState::new(8).into_handle();
        let shim_view = Arc::clone(&shared);
        let peer = Ipv6Addr::LOCALHOST;

        let cookie = shared.engine().current_cookie(&peer);
        shared.cache().insert_new(peer, false, cookie, 0);

        assert_eq!(shim_view.cache().lookup(&peer).map(|e| e.cookie()), Some(cookie));
        assert!(shim_view.engine().verify(&cookie, &peer));
    }

    #[test]
    fn test_rotate_bumps_epoch() {
        let shared = SharedState::new(1);
        assert_eq!(shared.engine().rotation_epoch(), 0);
        assert_eq!(shared.rotate(), 1);
        assert_eq!(shared.rotate(), 2);
    }

    #[test]
    fn test_concurrent_verifiers_and_rotation() {
        let shared = SharedState::new(16).into_handle();
        let peer = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let engine = shared.engine();
                        let cookie = engine.current_cookie(&peer);
                        assert!(engine.verify(&cookie, &peer));
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            shared.rotate();
        }
        for worker in workers {
            worker.join().expect("verifier thread");
        }
        assert_eq!(shared.engine().rotation_epoch(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_task_rotates_until_shutdown() {
        let shared = SharedState::new(1).into_handle();
        let shutdown = ShutdownSignal::new();
        let task = Arc::clone(&shared).spawn_rotation_task(Duration::from_secs(64), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(64 * 3 + 1)).await;
        assert_eq!(shared.engine().rotation_epoch(), 3);

        shutdown.initiate_shutdown();
        task.await.expect("rotation task joined");

        tokio::time::sleep(Duration::from_secs(64 * 2)).await;
        assert_eq!(shared.engine().rotation_epoch(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_rotation_does_not_catch_up() {
        let shared = SharedState::new(1).into_handle();
        let shutdown = ShutdownSignal::new();
        let task = Arc::clone(&shared).spawn_rotation_task(Duration::from_secs(64), shutdown.clone());
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let peer = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 9);
        let handed_out = shared.engine().current_cookie(&peer);

        // Runtime starved for three periods
        tokio::time::advance(Duration::from_secs(64 * 3)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(shared.engine().rotation_epoch(), 1);
        assert_eq!(shared.engine().check(&handed_out, &peer), Verification::Previous);

        shutdown.initiate_shutdown();
        task.await.expect("rotation task joined");
    }
}
