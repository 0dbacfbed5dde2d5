// =============================================================================
// Alert Tracker — edge-triggered, confirmation-counted state machine
// =============================================================================
//
// Converts noisy per-reading threshold decisions into at most one event per
// state transition. Each `(namespace, sensor)` key carries a committed
// state plus a pending state with a confirmation counter: a change of
// state only commits after `confirmation_count` consecutive like
// decisions, which absorbs single-sample sensor noise. Hysteresis is
// applied upstream, in the rule evaluator that produces `rule_violated`.
//
// State is process-local and never persisted: after a restart the first
// confirmed violation re-announces the alert, which is the intended
// behaviour (at-most-once is not promised).
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::types::{AlertState, Namespace, SensorId, Unit};

/// A committed alert or resolution transition handed to callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTransition {
    pub namespace: Namespace,
    pub sensor_name: SensorId,
    pub value: f64,
    pub unit: Unit,
    pub threshold: Option<f64>,
    pub recording_time: NaiveDateTime,
    pub is_resolved: bool,
}

/// Callback invoked synchronously on every committed transition. Must be
/// cheap; heavy work belongs to bus subscribers.
pub type AlertCallback = Box<dyn Fn(&AlertTransition) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct KeyState {
    state: AlertState,
    pending: AlertState,
    confirmations: u32,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: AlertState::Ok,
            pending: AlertState::Ok,
            confirmations: 0,
        }
    }
}

/// Per-process alert state machine. One instance per service, injected
/// into whatever audits readings.
pub struct AlertTracker {
    confirmation_count: u32,
    states: HashMap<(Namespace, SensorId), KeyState>,
    callbacks: HashMap<Namespace, AlertCallback>,
}

impl AlertTracker {
    /// `confirmation_count` consecutive like decisions are required to
    /// commit a state change (values below 1 behave as 1).
    pub fn new(confirmation_count: u32) -> Self {
        Self {
            confirmation_count: confirmation_count.max(1),
            states: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Register the single callback for a namespace, replacing any
    /// previous one.
    pub fn register_callback(&mut self, namespace: Namespace, callback: AlertCallback) {
        self.callbacks.insert(namespace, callback);
        debug!(namespace = %namespace, "registered alert callback");
    }

    /// Feed one classified reading into the machine and return the
    /// (possibly updated) committed state for its key.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        namespace: Namespace,
        sensor_name: SensorId,
        value: f64,
        unit: Unit,
        threshold: Option<f64>,
        rule_violated: bool,
        recording_time: NaiveDateTime,
    ) -> AlertState {
        let entry = self
            .states
            .entry((namespace, sensor_name.clone()))
            .or_default();

        let desired = if rule_violated {
            AlertState::InAlert
        } else {
            AlertState::Ok
        };

        if desired == entry.state {
            // Agreement with the committed state clears any half-built
            // pending transition.
            entry.pending = entry.state;
            entry.confirmations = 0;
            return entry.state;
        }

        if desired == entry.pending {
            entry.confirmations += 1;
            if entry.confirmations >= self.confirmation_count {
                entry.state = desired;
                entry.confirmations = 0;
                let transition = AlertTransition {
                    namespace,
                    sensor_name: sensor_name.clone(),
                    value,
                    unit,
                    threshold,
                    recording_time,
                    is_resolved: desired == AlertState::Ok,
                };
                self.emit(&transition);
            }
            return self.states[&(namespace, sensor_name)].state;
        }

        // Decision flipped away from the pending direction: restart the
        // confirmation count in the new direction.
        entry.pending = desired;
        entry.confirmations = 1;
        entry.state
    }

    fn emit(&self, transition: &AlertTransition) {
        if transition.is_resolved {
            info!(
                namespace = %transition.namespace,
                sensor = %transition.sensor_name,
                value = transition.value,
                "alert resolved"
            );
        } else {
            info!(
                namespace = %transition.namespace,
                sensor = %transition.sensor_name,
                value = transition.value,
                threshold = ?transition.threshold,
                "threshold crossed"
            );
        }
        if let Some(callback) = self.callbacks.get(&transition.namespace) {
            callback(transition);
        }
    }

    /// Committed state for a key (`Ok` for unseen keys).
    pub fn state(&self, namespace: Namespace, sensor_name: &SensorId) -> AlertState {
        self.states
            .get(&(namespace, sensor_name.clone()))
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Reset one sensor, one namespace, or everything. Test hook; not
    /// invoked in production.
    pub fn reset(&mut self, namespace: Option<Namespace>, sensor_name: Option<&SensorId>) {
        match (namespace, sensor_name) {
            (None, _) => self.states.clear(),
            (Some(ns), None) => self.states.retain(|(key_ns, _), _| *key_ns != ns),
            (Some(ns), Some(sensor)) => {
                self.states.remove(&(ns, sensor.clone()));
            }
        }
    }

    /// All keys currently committed to `IN_ALERT`.
    pub fn active_alerts(&self) -> Vec<(Namespace, SensorId)> {
        self.states
            .iter()
            .filter(|(_, s)| s.state == AlertState::InAlert)
            .map(|(key, _)| key.clone())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
