//! Shared bus condition flags.

use crate::config::FaultPolicy;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::error;

/**
    condition flags shared between the realtime threads, the notification callback and the
    application

    The fault flag is sticky: once raised it stays until [Self::clear_fault], so the
    application cannot miss a fault that came and went between two of its own cycles.
*/
pub struct BusStatus {
    policy: FaultPolicy,
    fault: AtomicBool,
    all_operational: AtomicBool,
    cycles: AtomicU64,
}

impl BusStatus {
    pub fn new(policy: FaultPolicy) -> Self {
        Self {
            policy,
            fault: AtomicBool::new(false),
            // assumed good until the stack reports otherwise
            all_operational: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
        }
    }

    /**
        single raise point for the master fault

        under [FaultPolicy::LogOnly] the condition is logged but the flag stays clear,
        repeated raises while already faulted stay silent
    */
    pub fn raise_fault(&self) {
        match self.policy {
            FaultPolicy::LogOnly => error!("master fault condition (fault reaction disabled)"),
            FaultPolicy::Enforce => {
                if ! self.fault.swap(true, Ordering::SeqCst) {
                    error!("master fault raised");
                }
            }
        }
    }

    pub fn fault(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }

    pub fn clear_fault(&self) {
        self.fault.store(false, Ordering::SeqCst);
    }

    pub fn all_operational(&self) -> bool {
        self.all_operational.load(Ordering::SeqCst)
    }

    pub fn set_all_operational(&self, value: bool) {
        self.all_operational.store(value, Ordering::SeqCst);
    }

    /// bus cycles completed since init
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_is_sticky() {
        let status = BusStatus::new(FaultPolicy::Enforce);
        assert!(! status.fault());
        status.raise_fault();
        status.raise_fault();
        assert!(status.fault());
        status.clear_fault();
        assert!(! status.fault());
    }

    #[test]
    fn log_only_policy_never_sets_the_flag() {
        let status = BusStatus::new(FaultPolicy::LogOnly);
        status.raise_fault();
        assert!(! status.fault());
    }
}
