//! Master configuration.

use std::time::Duration;

/// what raising the master fault actually does
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultPolicy {
    /// set the sticky fault flag, the application reacts to [crate::master::Master::fault]
    Enforce,
    /// only log, never set the flag (commissioning and bench setups)
    LogOnly,
}

/// optional mailbox protocol features to enable in the stack
#[derive(Copy, Clone, Debug, Default)]
pub struct ProtocolSupport {
    /// servo profile over the mailbox
    pub soe: bool,
    /// file transfer over the mailbox
    pub foe: bool,
    /// allow slaves to join and leave groups at runtime
    pub hot_connect: bool,
}

/**
    static configuration of a [crate::master::Master]

    `Default` gives the values proven on the reference hardware, only
    [Self::cycle_time] usually needs adjusting to the machine.
*/
#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// bus cycle period
    pub cycle_time: Duration,
    pub fault_policy: FaultPolicy,
    /// log every successful variable link and cycle diagnostics
    pub verbose_logging: bool,
    /// enable distributed clock synchronization and the bus time variable
    pub distributed_clocks: bool,
    /// trace the clock diagnostic every cycle
    pub log_clock_status: bool,
    pub protocols: ProtocolSupport,
    /// cpu to pin the timing thread on
    pub timing_cpu: Option<usize>,
    /// wait limit for a blocking bus state change
    pub state_change_timeout: Duration,
    /// wait limit for one synchronous mailbox transfer, also used for asynchronous requests
    pub transfer_timeout: Duration,
    /// minimum delay between two automatic recovery attempts
    pub recovery_timeout: Duration,
    /// wait limit for the realtime threads to report started/stopped
    pub startup_timeout: Duration,
    /// occurrences of one error class logged at full rate
    pub message_threshold: u32,
    /// past the threshold, log one occurrence out of this many
    pub reduced_message_rate: u32,
    /// overload score at which repeated cyclic frame loss raises the fault
    pub overload_fault_threshold: u32,
    /// maximum number of slaves the stack shall support
    pub max_slaves: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cycle_time: Duration::from_millis(1),
            fault_policy: FaultPolicy::Enforce,
            verbose_logging: false,
            distributed_clocks: true,
            log_clock_status: false,
            protocols: ProtocolSupport::default(),
            timing_cpu: None,
            state_change_timeout: Duration::from_secs(15),
            transfer_timeout: Duration::from_millis(500),
            recovery_timeout: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(2),
            message_threshold: 10,
            reduced_message_rate: 2000,
            overload_fault_threshold: 50,
            max_slaves: 35,
        }
    }
}

impl MasterConfig {
    /// bounded wait for a variable lock on the realtime path, a percent of the cycle
    pub fn lock_timeout(&self) -> Duration {
        self.cycle_time / 100
    }
}
