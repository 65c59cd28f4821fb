//! Processor Registry (spec §4.3): the single source of truth for which
//! processors exist, what they can handle, and how much headroom they have.
//!
//! Mutating operations on a single processor are linearizable (guarded by
//! that processor's own mutex); `inflight` is a lock-free atomic so the hot
//! path of reserve/release never blocks on the slower state fields. Reads for
//! routing take a snapshot and are never blocking on a writer for long.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Lifecycle state of a processor record (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Registering,
    Healthy,
    Unhealthy,
    Draining,
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyReason {
    HeartbeatTimeout,
    CircuitOpen,
    DispatchFailure,
}

/// Outcome recorded against a processor after a dispatch attempt completes
/// (spec §4.4: "success clears the counter, failure restarts cooldown").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failure,
}

/// Read-only view of a processor handed to the router; never mutated after
/// it's taken, so the router can sort/filter it freely without re-locking.
#[derive(Debug, Clone)]
pub struct ProcessorSnapshot {
    pub processor_id: String,
    pub queue_name: String,
    pub capabilities: HashSet<String>,
    pub declared_capacity: u32,
    pub inflight: u32,
    pub registered_at: DateTime<Utc>,
}

impl ProcessorSnapshot {
    pub fn load_ratio(&self) -> f64 {
        if self.declared_capacity == 0 {
            return f64::INFINITY;
        }
        self.inflight as f64 / self.declared_capacity as f64
    }

    pub fn has_capacity(&self) -> bool {
        self.inflight < self.declared_capacity
    }
}

struct ProcessorMeta {
    capabilities: HashSet<String>,
    declared_capacity: u32,
    state: ProcessorState,
    session_token: String,
    last_heartbeat_at: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    consecutive_failures: u32,
    unhealthy_since: Option<DateTime<Utc>>,
    unhealthy_reason: Option<UnhealthyReason>,
    circuit_cooldown_until: Option<DateTime<Utc>>,
    circuit_cooldown_current: Duration,
}

struct ProcessorRecord {
    processor_id: String,
    queue_name: String,
    inflight: AtomicU32,
    meta: Mutex<ProcessorMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    UnknownProcessor,
    SessionMismatch,
}

/// Result of [`Registry::register`]. `evicted_session` carries the prior
/// `session_token` when this registration superseded a different session on
/// the same `processor_id`, so the caller can log/account for the eviction.
pub struct RegisterOutcome {
    pub queue_name: String,
    pub evicted_session: Option<String>,
}

/// Thresholds the health monitor applies; the registry itself stores no
/// timers, it just exposes the bookkeeping the monitor reads and mutates.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub heartbeat_timeout: Duration,
    pub failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub circuit_cooldown_cap: Duration,
    pub eviction_grace: Duration,
}

pub struct Registry {
    processors: RwLock<HashMap<String, Arc<ProcessorRecord>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { processors: RwLock::new(HashMap::new()) }
    }

    /// Registers a processor, returning the dedicated queue name it should
    /// consume from and whether a prior session on this id was superseded.
    ///
    /// A re-register asserting the *same* `session_token` as the existing
    /// record is the same worker process reconnecting (e.g. after a control
    /// connection blip) — its `inflight` reservations are still real and
    /// must survive. Any other token (or no prior record) is a fresh
    /// session; the old one, if any, is evicted and its counters reset.
    pub fn register(
        &self,
        processor_id: &str,
        capabilities: HashSet<String>,
        declared_capacity: u32,
        session_token: String,
    ) -> RegisterOutcome {
        let now = Utc::now();
        let queue_name = format!("frames:processor:{processor_id}");

        let mut processors = self.processors.write().unwrap();
        if let Some(existing) = processors.get(processor_id) {
            let mut meta = existing.meta.lock().unwrap();
            if meta.session_token == session_token {
                meta.capabilities = capabilities;
                meta.declared_capacity = declared_capacity;
                meta.state = ProcessorState::Healthy;
                meta.unhealthy_since = None;
                meta.unhealthy_reason = None;
                meta.last_heartbeat_at = now;
                drop(meta);
                return RegisterOutcome { queue_name, evicted_session: None };
            }
        }

        let evicted_session = processors
            .get(processor_id)
            .map(|existing| existing.meta.lock().unwrap().session_token.clone());

        let record = Arc::new(ProcessorRecord {
            processor_id: processor_id.to_string(),
            queue_name: queue_name.clone(),
            inflight: AtomicU32::new(0),
            meta: Mutex::new(ProcessorMeta {
                capabilities,
                declared_capacity,
                state: ProcessorState::Healthy,
                session_token,
                last_heartbeat_at: now,
                registered_at: now,
                consecutive_failures: 0,
                unhealthy_since: None,
                unhealthy_reason: None,
                circuit_cooldown_until: None,
                circuit_cooldown_current: Duration::from_secs(0),
            }),
        });

        processors.insert(processor_id.to_string(), record);
        RegisterOutcome { queue_name, evicted_session }
    }

    pub fn heartbeat(
        &self,
        processor_id: &str,
        session_token: &str,
        inflight_observed: Option<u32>,
    ) -> Result<(), RegistryError> {
        let record = self.get(processor_id)?;
        let mut meta = record.meta.lock().unwrap();
        if meta.session_token != session_token {
            return Err(RegistryError::SessionMismatch);
        }
        meta.last_heartbeat_at = Utc::now();
        if meta.state == ProcessorState::Unhealthy
            && meta.unhealthy_reason == Some(UnhealthyReason::HeartbeatTimeout)
        {
            meta.state = ProcessorState::Healthy;
            meta.unhealthy_since = None;
            meta.unhealthy_reason = None;
        }
        drop(meta);

        // Reconcile reported inflight with our bookkeeping (spec §4.3: small
        // drift is expected and self-heals rather than being treated as an
        // error).
        if let Some(observed) = inflight_observed {
            record.inflight.store(observed, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn deregister(&self, processor_id: &str, session_token: &str) -> Result<(), RegistryError> {
        let record = self.get(processor_id)?;
        {
            let meta = record.meta.lock().unwrap();
            if meta.session_token != session_token {
                return Err(RegistryError::SessionMismatch);
            }
        }

        if record.inflight.load(Ordering::Relaxed) == 0 {
            self.processors.write().unwrap().remove(processor_id);
        } else {
            record.meta.lock().unwrap().state = ProcessorState::Draining;
        }
        Ok(())
    }

    pub fn drain(&self, processor_id: &str) -> Result<(), RegistryError> {
        let record = self.get(processor_id)?;
        let mut meta = record.meta.lock().unwrap();
        meta.state = ProcessorState::Draining;
        drop(meta);
        if record.inflight.load(Ordering::Relaxed) == 0 {
            self.processors.write().unwrap().remove(processor_id);
        }
        Ok(())
    }

    pub fn evict(&self, processor_id: &str) -> Result<(), RegistryError> {
        self.processors
            .write()
            .unwrap()
            .remove(processor_id)
            .map(|_| ())
            .ok_or(RegistryError::UnknownProcessor)
    }

    /// Snapshots every processor that is `Healthy` and declares all of
    /// `required_capabilities`, ordered arbitrarily (the router sorts).
    pub fn select_candidates(&self, required_capabilities: &HashSet<String>) -> Vec<ProcessorSnapshot> {
        self.processors
            .read()
            .unwrap()
            .values()
            .filter_map(|record| {
                let meta = record.meta.lock().unwrap();
                if meta.state != ProcessorState::Healthy {
                    return None;
                }
                if !required_capabilities.is_subset(&meta.capabilities) {
                    return None;
                }
                let inflight = record.inflight.load(Ordering::Relaxed);
                if inflight >= meta.declared_capacity {
                    return None;
                }
                Some(ProcessorSnapshot {
                    processor_id: record.processor_id.clone(),
                    queue_name: record.queue_name.clone(),
                    capabilities: meta.capabilities.clone(),
                    declared_capacity: meta.declared_capacity,
                    inflight,
                    registered_at: meta.registered_at,
                })
            })
            .collect()
    }

    /// True if at least one registered processor (in any state) declares the
    /// required capabilities. Used to distinguish `no_capability_match` from
    /// `all_busy`/`all_unhealthy` (spec §4.5).
    pub fn any_capable(&self, required_capabilities: &HashSet<String>) -> bool {
        self.processors.read().unwrap().values().any(|record| {
            let meta = record.meta.lock().unwrap();
            required_capabilities.is_subset(&meta.capabilities)
        })
    }

    /// True if at least one `Healthy` capable processor exists, regardless of
    /// capacity. Distinguishes `all_unhealthy` (none) from `all_busy` (some,
    /// but every one of them is at its declared capacity) once
    /// `select_candidates` has filtered busy processors out.
    pub fn any_healthy_capable(&self, required_capabilities: &HashSet<String>) -> bool {
        self.processors.read().unwrap().values().any(|record| {
            let meta = record.meta.lock().unwrap();
            meta.state == ProcessorState::Healthy && required_capabilities.is_subset(&meta.capabilities)
        })
    }

    /// Atomically reserves one inflight slot on `processor_id` if it still
    /// has headroom. Returns `false` without mutating anything on failure.
    pub fn try_reserve(&self, processor_id: &str, declared_capacity: u32) -> bool {
        let Some(record) = self.processors.read().unwrap().get(processor_id).cloned() else {
            return false;
        };

        let mut current = record.inflight.load(Ordering::Relaxed);
        loop {
            if current >= declared_capacity {
                return false;
            }
            match record.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Releases a previously reserved slot and records the dispatch outcome
    /// against the processor's failure-streak bookkeeping.
    pub fn release(&self, processor_id: &str, outcome: DispatchOutcome) {
        let Some(record) = self.processors.read().unwrap().get(processor_id).cloned() else {
            return;
        };

        record.inflight.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        }).ok();

        let mut meta = record.meta.lock().unwrap();
        match outcome {
            DispatchOutcome::Success => meta.consecutive_failures = 0,
            DispatchOutcome::Failure => meta.consecutive_failures += 1,
        }
        let draining_and_idle =
            meta.state == ProcessorState::Draining && record.inflight.load(Ordering::Relaxed) == 0;
        drop(meta);

        if draining_and_idle {
            self.processors.write().unwrap().remove(processor_id);
        }
    }

    pub fn mark_unhealthy(&self, processor_id: &str, reason: UnhealthyReason) {
        let Some(record) = self.processors.read().unwrap().get(processor_id).cloned() else {
            return;
        };
        let mut meta = record.meta.lock().unwrap();
        if meta.state != ProcessorState::Healthy {
            return;
        }
        meta.state = ProcessorState::Unhealthy;
        meta.unhealthy_since = Some(Utc::now());
        meta.unhealthy_reason = Some(reason);
    }

    /// Snapshot of every record for admin listing, independent of health.
    pub fn snapshot_all(&self) -> Vec<(ProcessorSnapshot, ProcessorState)> {
        self.processors
            .read()
            .unwrap()
            .values()
            .map(|record| {
                let meta = record.meta.lock().unwrap();
                (
                    ProcessorSnapshot {
                        processor_id: record.processor_id.clone(),
                        queue_name: record.queue_name.clone(),
                        capabilities: meta.capabilities.clone(),
                        declared_capacity: meta.declared_capacity,
                        inflight: record.inflight.load(Ordering::Relaxed),
                        registered_at: meta.registered_at,
                    },
                    meta.state,
                )
            })
            .collect()
    }

    /// Runs one health-monitor tick (spec §4.4): heartbeat timeouts, circuit
    /// breaker open/half-open/close transitions, and grace-period eviction.
    /// Returns the processor ids evicted this tick.
    pub fn run_health_tick(&self, thresholds: &HealthThresholds) -> Vec<String> {
        let now = Utc::now();
        let mut evicted = Vec::new();

        let ids: Vec<String> = self.processors.read().unwrap().keys().cloned().collect();
        for processor_id in ids {
            let Some(record) = self.processors.read().unwrap().get(&processor_id).cloned() else {
                continue;
            };
            let mut meta = record.meta.lock().unwrap();

            match meta.state {
                ProcessorState::Healthy => {
                    if now - meta.last_heartbeat_at
                        > chrono::Duration::from_std(thresholds.heartbeat_timeout).unwrap()
                    {
                        meta.state = ProcessorState::Unhealthy;
                        meta.unhealthy_since = Some(now);
                        meta.unhealthy_reason = Some(UnhealthyReason::HeartbeatTimeout);
                    } else if meta.consecutive_failures >= thresholds.failure_threshold {
                        let next_cooldown = if meta.circuit_cooldown_current.is_zero() {
                            thresholds.circuit_cooldown
                        } else {
                            (meta.circuit_cooldown_current * 2).min(thresholds.circuit_cooldown_cap)
                        };
                        meta.state = ProcessorState::Unhealthy;
                        meta.unhealthy_since = Some(now);
                        meta.unhealthy_reason = Some(UnhealthyReason::CircuitOpen);
                        meta.circuit_cooldown_current = next_cooldown;
                        meta.circuit_cooldown_until =
                            Some(now + chrono::Duration::from_std(next_cooldown).unwrap());
                    }
                }
                ProcessorState::Unhealthy => {
                    let grace_elapsed = meta
                        .unhealthy_since
                        .map(|since| now - since >= chrono::Duration::from_std(thresholds.eviction_grace).unwrap())
                        .unwrap_or(false);

                    if grace_elapsed && record.inflight.load(Ordering::Relaxed) == 0 {
                        drop(meta);
                        self.processors.write().unwrap().remove(&processor_id);
                        evicted.push(processor_id);
                        continue;
                    }

                    if meta.unhealthy_reason == Some(UnhealthyReason::CircuitOpen) {
                        let probe_due = meta
                            .circuit_cooldown_until
                            .map(|until| now >= until)
                            .unwrap_or(false);
                        if probe_due {
                            // Half-open probe: reinstate to healthy with a
                            // near-exhausted failure budget so a single
                            // fresh failure reopens the circuit immediately.
                            meta.state = ProcessorState::Healthy;
                            meta.unhealthy_since = None;
                            meta.unhealthy_reason = None;
                            meta.consecutive_failures = thresholds.failure_threshold.saturating_sub(1);
                        }
                    }
                }
                ProcessorState::Draining => {
                    if record.inflight.load(Ordering::Relaxed) == 0 {
                        drop(meta);
                        self.processors.write().unwrap().remove(&processor_id);
                        continue;
                    }
                }
                ProcessorState::Registering | ProcessorState::Evicted => {}
            }
        }

        evicted
    }

    fn get(&self, processor_id: &str) -> Result<Arc<ProcessorRecord>, RegistryError> {
        self.processors
            .read()
            .unwrap()
            .get(processor_id)
            .cloned()
            .ok_or(RegistryError::UnknownProcessor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn register_then_select_finds_capable_healthy_processor() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());

        let candidates = registry.select_candidates(&caps(&["detect"]));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].processor_id, "p1");
    }

    #[test]
    fn select_excludes_processors_missing_capability() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());

        assert!(registry.select_candidates(&caps(&["classify"])).is_empty());
        assert!(!registry.any_capable(&caps(&["classify"])));
        assert!(registry.any_capable(&caps(&["detect"])));
    }

    #[test]
    fn try_reserve_respects_capacity() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 1, "tok".to_string());

        assert!(registry.try_reserve("p1", 1));
        assert!(!registry.try_reserve("p1", 1));

        registry.release("p1", DispatchOutcome::Success);
        assert!(registry.try_reserve("p1", 1));
    }

    #[test]
    fn heartbeat_rejects_session_mismatch() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 1, "tok".to_string());
        assert_eq!(
            registry.heartbeat("p1", "wrong", None),
            Err(RegistryError::SessionMismatch)
        );
    }

    #[test]
    fn failure_streak_opens_circuit_on_health_tick() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());

        for _ in 0..5 {
            registry.release("p1", DispatchOutcome::Failure);
        }

        let thresholds = HealthThresholds {
            heartbeat_timeout: Duration::from_secs(60),
            failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(1),
            circuit_cooldown_cap: Duration::from_secs(10),
            eviction_grace: Duration::from_secs(60),
        };
        registry.run_health_tick(&thresholds);

        let snapshot = registry.snapshot_all();
        let (_, state) = snapshot.iter().find(|(s, _)| s.processor_id == "p1").unwrap();
        assert_eq!(*state, ProcessorState::Unhealthy);
        assert!(registry.select_candidates(&caps(&["detect"])).is_empty());
    }

    #[test]
    fn draining_with_zero_inflight_is_removed_immediately() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());
        registry.drain("p1").unwrap();
        assert!(registry.select_candidates(&caps(&["detect"])).is_empty());
        assert!(registry.snapshot_all().is_empty());
    }

    #[test]
    fn draining_with_inflight_waits_for_release() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());
        assert!(registry.try_reserve("p1", 4));
        registry.drain("p1").unwrap();
        assert_eq!(registry.snapshot_all().len(), 1);

        registry.release("p1", DispatchOutcome::Success);
        assert!(registry.snapshot_all().is_empty());
    }

    #[test]
    fn select_excludes_processors_at_capacity() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 1, "tok".to_string());
        assert!(registry.try_reserve("p1", 1));

        assert!(registry.select_candidates(&caps(&["detect"])).is_empty());
    }

    #[test]
    fn reregister_with_same_session_preserves_inflight() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok".to_string());
        assert!(registry.try_reserve("p1", 4));
        assert!(registry.try_reserve("p1", 4));

        let outcome = registry.register("p1", caps(&["detect", "classify"]), 8, "tok".to_string());
        assert!(outcome.evicted_session.is_none());

        let candidates = registry.select_candidates(&caps(&["detect", "classify"]));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].inflight, 2);
        assert_eq!(candidates[0].declared_capacity, 8);
    }

    #[test]
    fn reregister_with_different_session_resets_inflight_and_reports_eviction() {
        let registry = Registry::new();
        registry.register("p1", caps(&["detect"]), 4, "tok-a".to_string());
        assert!(registry.try_reserve("p1", 4));

        let outcome = registry.register("p1", caps(&["detect"]), 4, "tok-b".to_string());
        assert_eq!(outcome.evicted_session.as_deref(), Some("tok-a"));

        let candidates = registry.select_candidates(&caps(&["detect"]));
        assert_eq!(candidates[0].inflight, 0);
        assert_eq!(
            registry.heartbeat("p1", "tok-a", None),
            Err(RegistryError::SessionMismatch)
        );
        registry.heartbeat("p1", "tok-b", None).unwrap();
    }
}
