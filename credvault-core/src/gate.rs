//! Storage availability tracking.
//!
//! The gate starts from a connectivity probe and flips to
//! [`Availability::Unavailable`] the first time an operation hits a
//! connectivity-class failure. While unavailable, callers short-circuit
//! without touching storage.
//!
//! Recovery depends on [`RecoveryPolicy`]:
//! - [`RecoveryPolicy::StayDown`] (default): storage stays down until a new
//!   gate is built, i.e. until the vault is reconstructed.
//! - [`RecoveryPolicy::Reprobe`]: once the cached probe result is older than
//!   the cache window, the next call probes again and reopens the gate on
//!   success.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::store::Backend;

/// How long a storage-ready probe result is trusted by default.
pub const DEFAULT_PROBE_CACHE: Duration = Duration::from_secs(30);

/// Whether an unavailable store may come back within the same process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Stay unavailable until the gate is rebuilt.
    #[default]
    StayDown,
    /// Re-probe once the cached probe result has expired.
    Reprobe,
}

/// The two gate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
struct ProbeResult {
    checked_at: Instant,
    ready: bool,
}

/// Process-wide availability flag plus a short-lived probe cache.
///
/// Both pieces of state tolerate concurrent writers: the flag is a single
/// atomic bit and the cache is last-writer-wins. Concurrent probes are
/// idempotent.
#[derive(Debug)]
pub struct AvailabilityGate {
    available: AtomicBool,
    last_probe: Mutex<Option<ProbeResult>>,
    cache_ttl: Duration,
    recovery: RecoveryPolicy,
}

impl AvailabilityGate {
    /// Build a gate and set its initial state from a probe of `backend`.
    pub fn probed(backend: &dyn Backend, cache_ttl: Duration, recovery: RecoveryPolicy) -> Self {
        let gate = Self {
            available: AtomicBool::new(false),
            last_probe: Mutex::new(None),
            cache_ttl,
            recovery,
        };
        gate.probe(backend);
        gate
    }

    /// Round-trip to storage now, refreshing the cache and the state.
    pub fn probe(&self, backend: &dyn Backend) -> bool {
        let ready = backend.ping().is_ok();
        self.record_probe(ready);
        self.available.store(ready, Ordering::SeqCst);
        ready
    }

    /// Probe result, reusing a cached one younger than the cache window.
    pub fn storage_ready(&self, backend: &dyn Backend) -> bool {
        if let Some(cached) = self.cached_probe() {
            return cached;
        }
        self.probe(backend)
    }

    /// Whether an operation may proceed to storage.
    ///
    /// Under [`RecoveryPolicy::Reprobe`] an unavailable gate re-probes once
    /// its cached result has expired.
    pub fn admit(&self, backend: &dyn Backend) -> bool {
        if self.is_available() {
            return true;
        }
        match self.recovery {
            RecoveryPolicy::StayDown => false,
            RecoveryPolicy::Reprobe => {
                let ready = self.storage_ready(backend);
                if ready {
                    self.available.store(true, Ordering::SeqCst);
                }
                ready
            }
        }
    }

    /// Take storage offline after an operational failure.
    ///
    /// Returns `true` if this call changed the state.
    pub fn mark_unavailable(&self) -> bool {
        self.record_probe(false);
        self.available.swap(false, Ordering::SeqCst)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> Availability {
        if self.is_available() {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }

    pub fn recovery(&self) -> RecoveryPolicy {
        self.recovery
    }

    fn cached_probe(&self) -> Option<bool> {
        let last = *self.last_probe.lock();
        last.filter(|p| p.checked_at.elapsed() < self.cache_ttl)
            .map(|p| p.ready)
    }

    fn record_probe(&self, ready: bool) {
        *self.last_probe.lock() = Some(ProbeResult {
            checked_at: Instant::now(),
            ready,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBackend, OfflineBackend};

    #[test]
    fn test_initial_state_from_probe() {
        let up = AvailabilityGate::probed(&MemoryBackend::new(), DEFAULT_PROBE_CACHE, RecoveryPolicy::StayDown);
        assert_eq!(up.state(), Availability::Available);

        let down = AvailabilityGate::probed(
            &OfflineBackend::new("no database"),
            DEFAULT_PROBE_CACHE,
            RecoveryPolicy::StayDown,
        );
        assert_eq!(down.state(), Availability::Unavailable);
    }

    #[test]
    fn test_mark_unavailable_reports_transition_once() {
        let backend = MemoryBackend::new();
        let gate = AvailabilityGate::probed(&backend, DEFAULT_PROBE_CACHE, RecoveryPolicy::StayDown);
        assert!(gate.mark_unavailable());
        assert!(!gate.mark_unavailable());
        assert!(!gate.is_available());
    }

    #[test]
    fn test_stay_down_never_readmits() {
        let backend = MemoryBackend::new();
        let gate = AvailabilityGate::probed(&backend, Duration::ZERO, RecoveryPolicy::StayDown);
        gate.mark_unavailable();

        // Storage is fine again, but the gate stays closed
        assert!(!gate.admit(&backend));
        assert!(!gate.admit(&backend));
    }

    #[test]
    fn test_reprobe_waits_for_cache_window() {
        let backend = MemoryBackend::new();
        let gate = AvailabilityGate::probed(&backend, Duration::from_secs(3600), RecoveryPolicy::Reprobe);
        gate.mark_unavailable();

        // Cached "not ready" result is still fresh
        assert!(!gate.admit(&backend));
    }

    #[test]
    fn test_reprobe_recovers_after_cache_expiry() {
        let backend = MemoryBackend::new();
        let gate = AvailabilityGate::probed(&backend, Duration::ZERO, RecoveryPolicy::Reprobe);

        backend.set_offline(true);
        gate.mark_unavailable();
        assert!(!gate.admit(&backend));

        backend.set_offline(false);
        assert!(gate.admit(&backend));
        assert_eq!(gate.state(), Availability::Available);
    }

    #[test]
    fn test_storage_ready_uses_cache() {
        let backend = MemoryBackend::new();
        let gate = AvailabilityGate::probed(&backend, Duration::from_secs(3600), RecoveryPolicy::StayDown);

        backend.set_offline(true);
        assert!(gate.storage_ready(&backend), "fresh cached result is reused");
        assert!(!gate.probe(&backend));
        assert!(!gate.storage_ready(&backend));
    }
}
