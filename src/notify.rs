/*!
    Classification and routing of the stack's asynchronous events.

    [NotificationDispatcher::dispatch] runs on stack-internal threads, so it only moves
    atomic flags, takes variable locks and logs. The variable locks are blocking but only
    ever held for a few byte copies, so the wait stays far below a bus period. Four
    categories of events:
    informational (logged), transient bus disturbances (rate limited, log only), fault
    conditions (rate limited, raise the sticky fault), and protocol-contract violations
    (always logged, fatal).
*/

use crate::{
    ratelimit::RateLimiter,
    stack::{Notification, StackError, TransferHandle, TransferKind},
    status::BusStatus,
    variable::{TransferState, VariableSet},
};

use std::sync::Arc;

use log::{debug, error, info, warn};

/// one limiter per recurring error class
struct Limiters {
    presence: RateLimiter,
    link: RateLimiter,
    watchdog: RateLimiter,
    topology: RateLimiter,
    working_counter: RateLimiter,
    frame: RateLimiter,
    slave_error: RateLimiter,
    not_operational: RateLimiter,
}

/// routes every [Notification] to flags, variables and the log
pub struct NotificationDispatcher {
    status: Arc<BusStatus>,
    variables: Arc<VariableSet>,
    limiters: Limiters,
}

impl NotificationDispatcher {
    pub fn new(status: Arc<BusStatus>, variables: Arc<VariableSet>, threshold: u32, reduced_rate: u32) -> Self {
        let limiter = || RateLimiter::new(threshold, reduced_rate);
        Self {
            status,
            variables,
            limiters: Limiters {
                presence: limiter(),
                link: limiter(),
                watchdog: limiter(),
                topology: limiter(),
                working_counter: limiter(),
                frame: limiter(),
                slave_error: limiter(),
                not_operational: limiter(),
            },
        }
    }

    /// count one occurrence on the class limiter, true if it still deserves a log line
    fn limited(limiter: &RateLimiter, class: &str) -> bool {
        limiter.count();
        if limiter.on_limit() {
            warn!("reached maximum number of reports for {class}, reducing report rate");
        }
        limiter.should_log()
    }

    /// entry point, called by the closure registered with the stack
    pub fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::StateChanged {old, new} =>
                info!("bus state changed from {old} to {new}"),
            Notification::LinkConnected =>
                info!("link layer connected"),
            Notification::ScanCompleted {result} => match result {
                Ok(slaves) => info!("bus scan completed, {slaves} slaves found"),
                Err(code) => warn!("bus scan failed: {code}"),
            },
            Notification::SlaveAppeared {station} => {
                if Self::limited(&self.limiters.presence, "slave presence changes") {
                    info!("slave at station {station} appeared on the bus");
                }
            }
            Notification::SlaveVanished {station} => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.presence, "slave presence changes") {
                    error!("slave at station {station} vanished from the bus");
                }
            }

            Notification::LinkDisconnected => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.link, "link disconnections") {
                    error!("link layer disconnected");
                }
            }
            Notification::WatchdogExpired {station} => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.watchdog, "watchdog expirations") {
                    error!("process data watchdog expired on station {station}");
                }
            }
            Notification::LineCrossed {station} => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.topology, "topology errors") {
                    error!("crossed lines detected at station {station}");
                }
            }
            Notification::JunctionChanged {station, line_break} => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.topology, "topology errors") {
                    error!("junction change at station {station} (line break: {line_break})");
                }
            }

            Notification::WorkingCounterMismatch {command, address, expected, actual} => {
                if Self::limited(&self.limiters.working_counter, "working counter mismatches") {
                    warn!("cyclic command 0x{command:02x} at 0x{address:08x} returned working counter {actual}, expected {expected}");
                }
            }
            Notification::FrameResponse {cyclic, kind} => {
                if Self::limited(&self.limiters.frame, "frame response errors") {
                    let traffic = if cyclic {"cyclic"} else {"acyclic"};
                    warn!("{traffic} frame response error: {kind:?}");
                }
            }
            Notification::SlaveError {station, status, code} => {
                self.status.raise_fault();
                if Self::limited(&self.limiters.slave_error, "slave status errors") {
                    error!("station {station} reports error status 0x{status:04x}, code 0x{code:04x}");
                }
            }
            Notification::InitCommandAborted {station, index, sub, code} =>
                warn!("init command 0x{index:04x}.{sub} aborted on station {station}, code 0x{code:08x}"),

            Notification::MailboxCompleted {handle, transfer_id, kind, error} =>
                self.complete_transfer(handle, transfer_id, kind, error),
            Notification::Emergency {station, record} => {
                self.status.raise_fault();
                error!("emergency object from station {station}: code 0x{:04x}, register 0x{:02x}",
                    record.error_code(), record.error_register());
                match self.variables.find_emergency(station) {
                    Some(variable) => {
                        let mut state = variable.lock();
                        state.bytes.copy_from_slice(&record.to_bytes());
                        state.transfer = TransferState::Done;
                    }
                    None => error!("no emergency variable registered for station {station}"),
                }
            }

            Notification::NotAllOperational => {
                // first drop after a healthy period logs at full rate again
                if self.status.all_operational() {
                    self.limiters.not_operational.reset();
                }
                self.status.set_all_operational(false);
                self.status.raise_fault();
                if Self::limited(&self.limiters.not_operational, "operational state drops") {
                    error!("at least one slave left the operational state");
                }
            }
            Notification::AllOperational => {
                self.status.set_all_operational(true);
                info!("all slaves are operational again");
            }

            Notification::ClientRegistrationDropped => {
                self.status.raise_fault();
                error!("the stack dropped our notification registration");
            }
            Notification::Unknown {code} => {
                self.status.raise_fault();
                error!("notification with unknown code 0x{code:08x}");
            }
        }
    }

    fn complete_transfer(&self, handle: TransferHandle, transfer_id: u32, kind: TransferKind, error: Option<StackError>) {
        let Some(variable) = self.variables.find_transfer(handle) else {
            // stack-internal transfers complete without a registered variable
            debug!("completion of unregistered transfer {transfer_id}");
            return;
        };
        let mut state = variable.lock();
        if state.transfer_id != transfer_id {
            debug!("stale completion {transfer_id} on a variable now running transfer {}", state.transfer_id);
            return;
        }
        match error {
            None => state.transfer = TransferState::Done,
            Some(code) => {
                state.transfer = TransferState::Failed;
                let direction = match kind {
                    TransferKind::Download => "download",
                    TransferKind::Upload => "upload",
                };
                error!("mailbox {direction} {transfer_id} failed: {code}");
            }
        }
    }
}
