// src/schedule/phase.rs

use std::collections::HashMap;

use tracing::debug;

use crate::types::FieldId;

/// Where a field is in the debounce/run cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KeyPhase {
    #[default]
    Idle,
    /// A debounce timer is pending.
    Armed,
    /// A run holds the field's lease.
    Running,
    /// Auto-update was switched off after repeated failures.
    Disabled,
}

/// Phase of every field known to the runtime.
///
/// Pure bookkeeping: no timers or IO. Fields never seen are `Idle`. Every
/// transition method returns whether the transition was legal; illegal ones
/// leave the phase untouched.
#[derive(Debug, Clone, Default)]
pub struct PhaseTable {
    phases: HashMap<FieldId, KeyPhase>,
}

impl PhaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, field: FieldId) -> KeyPhase {
        self.phases.get(&field).copied().unwrap_or_default()
    }

    /// `Idle -> Armed`.
    pub fn arm(&mut self, field: FieldId) -> bool {
        self.transition(field, &[KeyPhase::Idle], KeyPhase::Armed)
    }

    /// `Armed -> Running`. A timer fired for an `Idle` field (e.g. armed by
    /// another process) is accepted too.
    pub fn start(&mut self, field: FieldId) -> bool {
        self.transition(field, &[KeyPhase::Armed, KeyPhase::Idle], KeyPhase::Running)
    }

    /// `Running -> Disabled | Armed | Idle`, in that order of precedence.
    pub fn finish(&mut self, field: FieldId, rescheduled: bool, disabled: bool) -> bool {
        let next = if disabled {
            KeyPhase::Disabled
        } else if rescheduled {
            KeyPhase::Armed
        } else {
            KeyPhase::Idle
        };
        self.transition(field, &[KeyPhase::Running], next)
    }

    /// Any phase -> `Disabled`.
    pub fn disable(&mut self, field: FieldId) {
        self.set(field, KeyPhase::Disabled);
    }

    /// `Disabled -> Idle`.
    pub fn enable(&mut self, field: FieldId) -> bool {
        self.transition(field, &[KeyPhase::Disabled], KeyPhase::Idle)
    }

    /// No field is armed or running.
    pub fn is_idle(&self) -> bool {
        self.phases
            .values()
            .all(|p| matches!(p, KeyPhase::Idle | KeyPhase::Disabled))
    }

    pub fn count(&self, phase: KeyPhase) -> usize {
        self.phases.values().filter(|p| **p == phase).count()
    }

    fn transition(&mut self, field: FieldId, from: &[KeyPhase], to: KeyPhase) -> bool {
        let current = self.phase(field);
        if !from.contains(&current) {
            debug!(field, ?current, ?to, "ignoring phase transition");
            return false;
        }
        self.set(field, to);
        true
    }

    fn set(&mut self, field: FieldId, phase: KeyPhase) {
        if phase == KeyPhase::Idle {
            self.phases.remove(&field);
        } else {
            self.phases.insert(field, phase);
        }
    }
}
