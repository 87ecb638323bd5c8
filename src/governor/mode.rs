//! Operating mode shared between the governor and the budget monitor.
//!
//! The monitor's actions only ever *set* flags here; setting a flag that is
//! already set is a no-op, so re-firing an action is harmless. Flags are
//! cleared by an operator through [`GovernorMode::clear`].

use std::collections::BTreeSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    #[default]
    Accepting,
    /// Emergency halt. Nothing is admitted until cleared.
    Rejecting,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    #[default]
    Standard,
    /// Shorter, cheaper generation parameters.
    Degraded,
}

/// Serializable view of the current mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub admission: AdmissionState,
    pub reject_reason: Option<String>,
    pub throttle_fraction: f64,
    pub quality: QualityLevel,
    pub aggressive_caching: bool,
    pub model_override: Option<String>,
    pub blocked_operations: Vec<String>,
}

impl ModeSnapshot {
    pub fn is_normal(&self) -> bool {
        *self == ModeSnapshot::default()
    }
}

#[derive(Debug, Default)]
pub struct GovernorMode {
    rejecting: AtomicBool,
    reject_reason: RwLock<Option<String>>,
    throttle_bits: AtomicU64,
    degraded: AtomicBool,
    aggressive_caching: AtomicBool,
    model_override: RwLock<Option<String>>,
    blocked: RwLock<BTreeSet<String>>,
    changes: AtomicU64,
}

impl GovernorMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admission(&self) -> AdmissionState {
        if self.rejecting.load(Ordering::Acquire) {
            AdmissionState::Rejecting
        } else {
            AdmissionState::Accepting
        }
    }

    pub fn is_rejecting(&self) -> bool {
        self.admission() == AdmissionState::Rejecting
    }

    pub fn reject_reason(&self) -> Option<String> {
        self.reject_reason
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Enter `Rejecting`. Returns `false` if already rejecting.
    pub fn set_rejecting(&self, reason: impl Into<String>) -> bool {
        if self.rejecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reason = reason.into();
        tracing::error!(reason = %reason, "Governor entered REJECTING mode");
        *self.reject_reason.write().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.bump();
        true
    }

    /// Leave `Rejecting` without touching other flags.
    pub fn clear_rejecting(&self) -> bool {
        if !self.rejecting.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.reject_reason.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::info!("Governor admission restored");
        self.bump();
        true
    }

    pub fn throttle_fraction(&self) -> f64 {
        f64::from_bits(self.throttle_bits.load(Ordering::Relaxed))
    }

    /// Raise the throttle fraction. A lower value than the current one is a
    /// no-op; only [`clear`](Self::clear) lowers it.
    pub fn set_throttle(&self, fraction: f64) -> bool {
        let fraction = fraction.clamp(0.0, 1.0);
        let raised = self
            .throttle_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (fraction > f64::from_bits(bits)).then(|| fraction.to_bits())
            })
            .is_ok();
        if raised {
            tracing::warn!(fraction, "Admission throttle raised");
            self.bump();
        }
        raised
    }

    /// Roll the dice for one admission against the throttle fraction.
    pub fn should_throttle(&self) -> bool {
        let fraction = self.throttle_fraction();
        if fraction <= 0.0 {
            return false;
        }
        fraction >= 1.0 || rand::random::<f64>() < fraction
    }

    pub fn quality(&self) -> QualityLevel {
        if self.degraded.load(Ordering::Relaxed) {
            QualityLevel::Degraded
        } else {
            QualityLevel::Standard
        }
    }

    pub fn set_degraded(&self) -> bool {
        let changed = !self.degraded.swap(true, Ordering::AcqRel);
        if changed {
            tracing::warn!("Response quality degraded");
            self.bump();
        }
        changed
    }

    pub fn aggressive_caching(&self) -> bool {
        self.aggressive_caching.load(Ordering::Relaxed)
    }

    pub fn set_aggressive_caching(&self) -> bool {
        let changed = !self.aggressive_caching.swap(true, Ordering::AcqRel);
        if changed {
            tracing::warn!("Aggressive caching enabled");
            self.bump();
        }
        changed
    }

    pub fn model_override(&self) -> Option<String> {
        self.model_override
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_model_override(&self, model: impl Into<String>) -> bool {
        let model = model.into();
        let mut current = self.model_override.write().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(model.as_str()) {
            return false;
        }
        tracing::warn!(model = %model, "Upstream model downgraded");
        *current = Some(model);
        drop(current);
        self.bump();
        true
    }

    pub fn is_blocked(&self, operation: &str) -> bool {
        self.blocked
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(operation)
    }

    /// Block operation classes. Returns `true` if any was newly blocked.
    pub fn block_operations<I, S>(&self, operations: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut blocked = self.blocked.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = false;
        for op in operations {
            let op = op.into();
            if blocked.insert(op.clone()) {
                tracing::warn!(operation = %op, "Operation class blocked");
                changed = true;
            }
        }
        drop(blocked);
        if changed {
            self.bump();
        }
        changed
    }

    /// Operator reset: every remediation flag back to normal.
    pub fn clear(&self) {
        self.rejecting.store(false, Ordering::Release);
        *self.reject_reason.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.throttle_bits.store(0f64.to_bits(), Ordering::Release);
        self.degraded.store(false, Ordering::Release);
        self.aggressive_caching.store(false, Ordering::Release);
        *self.model_override.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.blocked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.bump();
        tracing::info!("Governor mode cleared");
    }

    /// Monotonic counter of mode changes.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            admission: self.admission(),
            reject_reason: self.reject_reason(),
            throttle_fraction: self.throttle_fraction(),
            quality: self.quality(),
            aggressive_caching: self.aggressive_caching(),
            model_override: self.model_override(),
            blocked_operations: self
                .blocked
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_normal() {
        let mode = GovernorMode::new();
        assert!(mode.snapshot().is_normal());
        assert!(!mode.should_throttle());
        assert_eq!(mode.admission(), AdmissionState::Accepting);
    }

    #[test]
    fn test_setters_are_idempotent() {
        let mode = GovernorMode::new();
        assert!(mode.set_rejecting("budget exhausted"));
        assert!(!mode.set_rejecting("again"));
        assert_eq!(mode.reject_reason().as_deref(), Some("budget exhausted"));

        assert!(mode.set_degraded());
        assert!(!mode.set_degraded());

        assert!(mode.set_aggressive_caching());
        assert!(!mode.set_aggressive_caching());

        assert!(mode.set_model_override("small"));
        assert!(!mode.set_model_override("small"));
        assert!(mode.set_model_override("tiny"));

        assert!(mode.block_operations(["summarize"]));
        assert!(!mode.block_operations(["summarize"]));
        assert!(mode.is_blocked("summarize"));
        assert!(!mode.is_blocked("generate"));
    }

    #[test]
    fn test_throttle_only_rises() {
        let mode = GovernorMode::new();
        assert!(mode.set_throttle(0.5));
        assert!(!mode.set_throttle(0.2));
        assert_eq!(mode.throttle_fraction(), 0.5);
        assert!(mode.set_throttle(2.0));
        assert_eq!(mode.throttle_fraction(), 1.0);
        assert!(mode.should_throttle());
    }

    #[test]
    fn test_clear() {
        let mode = GovernorMode::new();
        mode.set_rejecting("halt");
        mode.set_throttle(0.3);
        mode.set_model_override("small");
        mode.block_operations(["a", "b"]);
        let before = mode.changes();

        mode.clear();
        assert!(mode.snapshot().is_normal());
        assert!(mode.changes() > before);
    }

    #[test]
    fn test_clear_rejecting_keeps_other_flags() {
        let mode = GovernorMode::new();
        mode.set_rejecting("halt");
        mode.set_degraded();

        assert!(mode.clear_rejecting());
        assert!(!mode.clear_rejecting());
        assert_eq!(mode.quality(), QualityLevel::Degraded);
        assert!(mode.reject_reason().is_none());
    }
}
