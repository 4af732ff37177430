/*!
    Requested-vs-actual bus state bookkeeping and automatic recovery.

    When slaves drop out of OP the master steps the whole bus down before stepping it up
    again: a partial segment first goes to SAFEOP, and only once every configured slave is
    back on the segment does the bus go through INIT and up to the requested state. Each
    attempt arms a hold-off window so a slow transition is never interrupted by the next
    evaluation.
*/

use crate::{
    config::MasterConfig,
    error::{BusError, BusResult},
    stack::{BusState, FieldbusStack, WaitMode},
    status::BusStatus,
};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::{error, info, warn};

/// progress of the current automatic recovery attempt
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RecoveryPhase {
    Idle,
    /// a transition was requested, no new attempt before the deadline
    Armed {deadline: Instant},
}

/// drives bus state requests and the step-down/step-up recovery policy
pub struct RecoveryStateMachine {
    stack: Arc<dyn FieldbusStack>,
    status: Arc<BusStatus>,
    requested: BusState,
    phase: RecoveryPhase,
    state_change_timeout: Duration,
    recovery_timeout: Duration,
}

impl RecoveryStateMachine {
    pub fn new(stack: Arc<dyn FieldbusStack>, status: Arc<BusStatus>, config: &MasterConfig) -> Self {
        Self {
            stack,
            status,
            requested: BusState::Unknown,
            phase: RecoveryPhase::Idle,
            state_change_timeout: config.state_change_timeout,
            recovery_timeout: config.recovery_timeout,
        }
    }

    /// state the application last asked for
    pub fn requested_state(&self) -> BusState {
        self.requested
    }

    /// true while an automatic recovery attempt is still in its hold-off window
    pub fn recovery_active(&self) -> bool {
        match self.phase {
            RecoveryPhase::Idle => false,
            RecoveryPhase::Armed {deadline} => Instant::now() < deadline,
        }
    }

    /**
        request a bus state on behalf of the application

        blocking requests wait for completion up to the state change timeout; a failed
        request raises the fault and reports the clock diagnostic, since a desynchronized
        clock is the most frequent cause of a refused transition
    */
    pub fn request_state(&mut self, state: BusState, blocking: bool) -> BusResult {
        self.requested = state;
        let wait = if blocking {WaitMode::Block(self.state_change_timeout)} else {WaitMode::NoWait};
        if let Err(code) = self.stack.set_master_state(state, wait) {
            error!("cannot bring the bus to {state}: {code}");
            match self.stack.clock_status() {
                Ok(clock) => error!(
                    "clock diagnostic: status 0x{:08x}, deviation {} ns (avg {} ns, max {} ns)",
                    clock.status, clock.diff_current, clock.diff_average, clock.diff_max),
                Err(code) => warn!("clock diagnostic unavailable: {code}"),
            }
            self.status.raise_fault();
            return Err(BusError::Stack(code));
        }
        Ok(())
    }

    /**
        evaluate the recovery policy once, called from [crate::master::Master::process]

        does nothing while every slave is operational or while a previous attempt is still
        armed; the step-up branches additionally wait for the application to reset the
        fault, the step-down to SAFEOP happens unconditionally
    */
    pub fn evaluate(&mut self, current: BusState) {
        if let RecoveryPhase::Armed {deadline} = self.phase {
            if Instant::now() < deadline
                {return}
            self.phase = RecoveryPhase::Idle;
        }
        if self.status.all_operational()
            {return}

        let connected = self.stack.connected_slaves();
        let configured = self.stack.configured_slaves();

        if current == BusState::Op {
            // part of the segment is gone, step down before anything else
            warn!("{connected}/{configured} slaves present, stepping the bus down to SAFEOP");
            self.switch(BusState::SafeOp);
        }
        else if ! self.status.fault() && connected == configured && current != BusState::Init {
            warn!("all {configured} slaves back, restarting the bus through INIT");
            self.switch(BusState::Init);
        }
        else if ! self.status.fault() && connected == configured
            && current == BusState::Init && self.requested == BusState::Op {
            info!("bringing the bus back to OP");
            self.switch(BusState::Op);
        }
    }

    /// internal non-blocking transition, does not touch the application's requested state
    fn switch(&mut self, state: BusState) {
        if let Err(code) = self.stack.set_master_state(state, WaitMode::NoWait) {
            error!("recovery transition to {state} failed: {code}");
            self.status.raise_fault();
        }
        self.phase = RecoveryPhase::Armed {deadline: Instant::now() + self.recovery_timeout};
    }
}
