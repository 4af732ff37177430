/*!
    The coordination master: realtime threads, bus cycle, application surface.

    Two realtime threads drive the bus. The timing thread does nothing but tick once per
    cycle at the highest priority, optionally pinned to a dedicated cpu. The job thread
    wakes on each tick one priority step below and runs the cycle phases: receive the
    previous cycle's frames, refresh the input variables, refresh the output image, queue
    the next cyclic and acyclic frames. Application threads never touch the wire, they
    exchange data through the variables and the mailbox transfer calls, and pump
    housekeeping through [Master::process].
*/

use crate::{
    binding::{LinkStatistics, VariableBinder},
    config::MasterConfig,
    data::{copy_bits, get_bit, BusData, TypeId},
    error::{BusError, BusResult},
    notify::NotificationDispatcher,
    ratelimit::RateLimiter,
    recovery::RecoveryStateMachine,
    sdo::SdoTransferManager,
    slave::Slave,
    stack::{
        BusState, ClientId, CyclePhase, Direction, DescriptionSource, FieldbusStack,
        LinkLayer, StackParameters,
    },
    status::BusStatus,
    sync::Event,
    variable::{Binding, BusVar, VariableSet},
};

use core::sync::atomic::{AtomicBool, Ordering};
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{error, info, trace, warn};
use parking_lot::Mutex;

/// overload score added for each cycle whose frames did not all come back
const OVERLOAD_PENALTY: u32 = 10;

/// state shared with the realtime threads
struct Runtime {
    shutdown: AtomicBool,
    timing_running: AtomicBool,
    job_running: AtomicBool,
    started: Event,
    stopped: Event,
    /// one pulse per bus period, timing thread to job thread
    tick: Event,
    /// pulsed when the transmission window of the new cycle opens
    tx_window: Event,
    /// pulsed when the input variables carry the new cycle's data
    rx_data: Event,
}

impl Runtime {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            timing_running: AtomicBool::new(false),
            job_running: AtomicBool::new(false),
            started: Event::new(),
            stopped: Event::new(),
            tick: Event::new(),
            tx_window: Event::new(),
            rx_data: Event::new(),
        }
    }
}

/// everything the job thread needs, moved into its closure
struct JobContext {
    stack: Arc<dyn FieldbusStack>,
    status: Arc<BusStatus>,
    variables: Arc<VariableSet>,
    runtime: Arc<Runtime>,
    lock_timeout: Duration,
    cycle_time: Duration,
    overload_fault_threshold: u32,
    overload_limiter: RateLimiter,
    log_clock_status: bool,
    verbose: bool,
}

/**
    realtime coordination master over a vendor fieldbus stack

    Lifecycle: [Self::new] → [Self::init] (stack up, threads running) → [Self::configure]
    (bus description loaded, notifications wired) → variable binding → state requests →
    cyclic operation. [Self::shutdown] reverses everything and is also run on drop.
*/
pub struct Master {
    stack: Arc<dyn FieldbusStack>,
    link: Box<dyn LinkLayer>,
    config: MasterConfig,
    status: Arc<BusStatus>,
    variables: Arc<VariableSet>,
    runtime: Arc<Runtime>,
    slaves: Vec<Arc<Slave>>,
    recovery: Mutex<RecoveryStateMachine>,
    binder: Option<VariableBinder>,
    transfers: Option<SdoTransferManager>,
    client: Option<ClientId>,
    timing_thread: Option<JoinHandle<()>>,
    job_thread: Option<JoinHandle<()>>,
    /// distributed bus time of the running cycle, bound by [Self::configure]
    bus_time: BusVar<u32>,
    /// last bus state seen by [Self::process]
    processed_state: Mutex<BusState>,
    statistics_logged: AtomicBool,
    initialized: bool,
    configured: bool,
}

impl Master {
    pub fn new(stack: Arc<dyn FieldbusStack>, link: Box<dyn LinkLayer>, config: MasterConfig) -> Self {
        let status = Arc::new(BusStatus::new(config.fault_policy));
        let recovery = RecoveryStateMachine::new(stack.clone(), status.clone(), &config);
        Self {
            stack,
            link,
            status,
            variables: Arc::new(VariableSet::new()),
            runtime: Arc::new(Runtime::new()),
            slaves: Vec::new(),
            recovery: Mutex::new(recovery),
            binder: None,
            transfers: None,
            client: None,
            timing_thread: None,
            job_thread: None,
            bus_time: BusVar::input(),
            processed_state: Mutex::new(BusState::Unknown),
            statistics_logged: AtomicBool::new(false),
            initialized: false,
            configured: false,
            config,
        }
    }

    /// declare a slave, must happen before [Self::configure]
    pub fn add_slave(&mut self, slave: Slave) -> Arc<Slave> {
        let slave = Arc::new(slave);
        self.slaves.push(slave.clone());
        slave
    }

    /**
        bring the stack up and start the realtime threads

        returns once both threads reported ready or the startup timeout elapsed
    */
    pub fn init(&mut self) -> BusResult {
        if self.initialized
            {return Err(BusError::Master("master is already initialized"))}

        self.stack.init(&StackParameters {
            link: self.link.parameters(),
            cycle_time: self.config.cycle_time,
            max_slaves: self.config.max_slaves,
            distributed_clocks: self.config.distributed_clocks,
            protocols: self.config.protocols,
        })?;

        let timing = {
            let runtime = self.runtime.clone();
            let cycle_time = self.config.cycle_time;
            let cpu = self.config.timing_cpu;
            std::thread::Builder::new()
                .name("bus-timing".into())
                .spawn(move || timing_loop(runtime, cycle_time, cpu))
                .map_err(|_| BusError::Master("cannot spawn the timing thread"))?
        };
        make_realtime(&timing, 99);
        if ! self.wait_thread_started(&self.runtime.timing_running) {
            self.runtime.shutdown.store(true, Ordering::SeqCst);
            let _ = self.stack.deinit();
            return Err(BusError::Timeout("timing thread startup"));
        }
        self.timing_thread = Some(timing);

        let job = {
            let context = JobContext {
                stack: self.stack.clone(),
                status: self.status.clone(),
                variables: self.variables.clone(),
                runtime: self.runtime.clone(),
                lock_timeout: self.config.lock_timeout(),
                cycle_time: self.config.cycle_time,
                overload_fault_threshold: self.config.overload_fault_threshold,
                overload_limiter: RateLimiter::new(
                    self.config.message_threshold,
                    self.config.reduced_message_rate,
                    ),
                log_clock_status: self.config.log_clock_status,
                verbose: self.config.verbose_logging,
            };
            std::thread::Builder::new()
                .name("bus-job".into())
                .spawn(move || job_loop(context))
                .map_err(|_| BusError::Master("cannot spawn the job thread"))?
        };
        make_realtime(&job, 98);
        if ! self.wait_thread_started(&self.runtime.job_running) {
            self.runtime.shutdown.store(true, Ordering::SeqCst);
            let _ = self.stack.deinit();
            return Err(BusError::Timeout("job thread startup"));
        }
        self.job_thread = Some(job);

        self.initialized = true;
        info!("master initialized, cycle time {:?}", self.config.cycle_time);
        Ok(())
    }

    fn wait_thread_started(&self, flag: &AtomicBool) -> bool {
        let deadline = Instant::now() + self.config.startup_timeout;
        while ! flag.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline
                {return false}
            self.runtime.started.wait_timeout(deadline - now);
        }
        true
    }

    /**
        load the bus description and wire the notification routing

        also binds the distributed bus time input when clocks are enabled; a segment
        without that entry only warns, single-slave machines legitimately run without it
    */
    pub fn configure(&mut self, description: &DescriptionSource) -> BusResult {
        if ! self.initialized
            {return Err(BusError::Master("master is not initialized"))}
        if self.configured
            {return Err(BusError::Master("master is already configured"))}

        self.stack.configure(description)?;

        let dispatcher = Arc::new(NotificationDispatcher::new(
            self.status.clone(),
            self.variables.clone(),
            self.config.message_threshold,
            self.config.reduced_message_rate,
            ));
        let client = self.stack.register_notification_client(
            Arc::new(move |notification| dispatcher.dispatch(notification))
            )?;
        self.client = Some(client);
        self.binder = Some(VariableBinder::new(self.stack.clone(), self.config.verbose_logging));
        self.transfers = Some(SdoTransferManager::new(
            self.stack.clone(),
            client,
            self.status.clone(),
            self.config.transfer_timeout,
            ));

        if self.config.distributed_clocks {
            self.bind_bus_time();
        }

        self.configured = true;
        Ok(())
    }

    /// the bus time entry has no slave prefix, so it bypasses the binder
    fn bind_bus_time(&self) {
        match self.stack.find_variable(Direction::Input, "Inputs.BusTime") {
            Ok(info) => {
                if info.bit_size != 32 || ! TypeId::U32.matches(info.type_code) {
                    warn!("bus time entry has unexpected layout ({} bits, type {})",
                        info.bit_size, info.type_code);
                    return;
                }
                if self.bus_time.core().bind(Binding::Process {bit_offset: info.bit_offset}).is_ok() {
                    self.variables.register(self.bus_time.core().clone());
                }
            }
            Err(_) => warn!("no bus time in the configuration, bus_time() will stay 0"),
        }
    }

    fn binder(&self) -> BusResult<&VariableBinder> {
        self.binder.as_ref().ok_or(BusError::Master("master is not configured"))
    }

    fn transfers(&self) -> BusResult<&SdoTransferManager> {
        self.transfers.as_ref().ok_or(BusError::Master("master is not configured"))
    }

    /// attach a cyclic variable to the process data entry `slave-name.name`
    pub fn bind_process_variable<T: BusData>(&self, slave: &Slave, name: &str, variable: &BusVar<T>) -> BusResult {
        self.binder()?.bind_process_variable(slave, name, variable.core())?;
        self.variables.register(variable.core().clone());
        Ok(())
    }

    /// attach a mailbox variable to object `index.sub` on the slave
    pub fn bind_mailbox_variable<T: BusData>(&self, slave: &Slave, index: u16, sub: u8, variable: &BusVar<T>) -> BusResult {
        self.binder()?.bind_mailbox_variable(slave, index, sub, variable.core())?;
        self.variables.register(variable.core().clone());
        Ok(())
    }

    /// queue an asynchronous download of the variable's current bytes
    pub fn download<T: BusData>(&self, variable: &BusVar<T>) -> BusResult {
        self.transfers()?.download(variable.core())
    }

    /// queue an asynchronous upload into the variable
    pub fn upload<T: BusData>(&self, variable: &BusVar<T>) -> BusResult {
        self.transfers()?.upload(variable.core())
    }

    /// blocking download of raw bytes to one object
    pub fn sync_download(&self, slave: &Slave, index: u16, sub: u8, data: &[u8]) -> BusResult {
        self.transfers()?.sync_download(slave, index, sub, data)
    }

    /// blocking upload of one object, returns the received length
    pub fn sync_upload(&self, slave: &Slave, index: u16, sub: u8, data: &mut [u8]) -> BusResult<usize> {
        self.transfers()?.sync_upload(slave, index, sub, data)
    }

    /// current state of the bus state machine
    pub fn state(&self) -> BusState {
        self.stack.master_state()
    }

    /// request a bus state, blocking waits for completion
    pub fn request_state(&self, state: BusState, blocking: bool) -> BusResult {
        self.recovery.lock().request_state(state, blocking)
    }

    /// state the application last asked for
    pub fn requested_state(&self) -> BusState {
        self.recovery.lock().requested_state()
    }

    /// true while an automatic recovery attempt is in its hold-off window
    pub fn recovery_active(&self) -> bool {
        self.recovery.lock().recovery_active()
    }

    /// sticky master fault flag
    pub fn fault(&self) -> bool {
        self.status.fault()
    }

    /**
        clear the sticky fault and ask for OP again

        while an automatic recovery attempt is armed only the flag is cleared, the
        recovery machine keeps driving the bus
    */
    pub fn reset_fault(&self) {
        {
            let mut recovery = self.recovery.lock();
            if ! recovery.recovery_active() {
                if let Err(error) = recovery.request_state(BusState::Op, false) {
                    warn!("fault reset could not re-request OP: {error}");
                }
            }
        }
        self.status.clear_fault();
        info!("master fault cleared");
    }

    /// block until the transmission window of the next cycle opens
    pub fn wait_for_bus(&self) {
        self.runtime.tx_window.wait();
    }

    /// block until the input variables carry the next cycle's data
    pub fn wait_for_bus_rx_data(&self) {
        self.runtime.rx_data.wait();
    }

    /**
        housekeeping pump, to be called periodically from a non-realtime thread

        evaluates the recovery policy, runs the slave device hooks, and logs the link
        statistics once the bus first leaves UNKNOWN
    */
    pub fn process(&self) {
        let current = self.stack.master_state();
        self.recovery.lock().evaluate(current);

        let previous = {
            let mut processed = self.processed_state.lock();
            core::mem::replace(&mut *processed, current)
        };
        if matches!(current, BusState::SafeOp | BusState::Op) {
            for slave in &self.slaves {
                if current == BusState::Op && previous != BusState::Op {
                    slave.enter_operational();
                }
                slave.process();
            }
        }
        if previous == BusState::Unknown && current != BusState::Unknown
            && ! self.statistics_logged.swap(true, Ordering::SeqCst) {
            if let Some(binder) = &self.binder {
                log_statistics(binder.statistics());
            }
        }
    }

    /// distributed bus time of the running cycle, 0 when unavailable
    pub fn bus_time(&self) -> u32 {
        self.bus_time.get()
    }

    pub fn bus_cycle_time(&self) -> Duration {
        self.config.cycle_time
    }

    /// bus cycles completed since init
    pub fn cycle_count(&self) -> u64 {
        self.status.cycle_count()
    }

    /**
        stop the bus and release everything, reverse of [Self::init] + [Self::configure]

        best effort: every step runs even if a previous one failed, so a wedged stack
        cannot leak the notification client or the mailbox transfer objects
    */
    pub fn shutdown(&mut self) {
        if ! self.initialized
            {return}

        if self.configured {
            if let Err(error) = self.recovery.lock().request_state(BusState::Init, true) {
                warn!("cannot bring the bus down to INIT: {error}");
            }
        }

        self.runtime.shutdown.store(true, Ordering::SeqCst);
        // wake the job thread out of its tick wait
        self.runtime.tick.signal();
        let deadline = Instant::now() + self.config.startup_timeout;
        while self.runtime.timing_running.load(Ordering::SeqCst)
            || self.runtime.job_running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                warn!("realtime threads did not stop in time");
                break;
            }
            self.runtime.stopped.wait_timeout(deadline - now);
        }
        for handle in [self.timing_thread.take(), self.job_thread.take()].into_iter().flatten() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        if let Some(client) = self.client.take() {
            if let Err(code) = self.stack.unregister_notification_client(client) {
                warn!("cannot unregister the notification client: {code}");
            }
        }
        for variable in self.variables.mailbox().iter() {
            if let Some(Binding::Mailbox {handle, ..}) = variable.binding() {
                if let Err(code) = self.stack.delete_mailbox_transfer(*handle) {
                    warn!("cannot release mailbox transfer: {code}");
                }
            }
        }
        if let Err(code) = self.stack.deinit() {
            warn!("stack deinit failed: {code}");
        }

        self.binder = None;
        self.transfers = None;
        self.configured = false;
        self.initialized = false;
        info!("master shut down");
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_statistics(statistics: LinkStatistics) {
    info!("linked {} process variables ({} bytes), {} mailbox objects ({} bytes)",
        statistics.process_count, statistics.process_bytes,
        statistics.mailbox_count, statistics.mailbox_bytes);
}

/// ticks once per bus period until shutdown
fn timing_loop(runtime: Arc<Runtime>, cycle_time: Duration, cpu: Option<usize>) {
    #[cfg(target_os = "linux")]
    if let Some(cpu) = cpu {
        pin_to_cpu(cpu);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = cpu;

    runtime.timing_running.store(true, Ordering::SeqCst);
    runtime.started.signal();

    let mut next = Instant::now() + cycle_time;
    while ! runtime.shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if next > now {
            std::thread::sleep(next - now);
        }
        else {
            // late tick, resynchronize instead of bursting
            next = now;
        }
        next += cycle_time;
        runtime.tick.signal();
    }

    runtime.timing_running.store(false, Ordering::SeqCst);
    runtime.stopped.signal();
}

/// runs the cycle phases on every tick until shutdown
fn job_loop(context: JobContext) {
    let runtime = context.runtime.clone();
    runtime.job_running.store(true, Ordering::SeqCst);
    runtime.started.signal();

    // consecutive-loss score, decays one point per clean cycle
    let mut overload: u32 = 0;

    while ! runtime.shutdown.load(Ordering::SeqCst) {
        if ! runtime.tick.wait_timeout(context.cycle_time * 4)
            {continue}

        // the previous cycle's frames are in, a new transmission window opens
        runtime.tx_window.signal();

        match context.stack.exec_cycle(CyclePhase::ReceiveFrames) {
            Ok(all_received) => overload = update_overload(
                &context.overload_limiter,
                &context.status,
                context.overload_fault_threshold,
                overload,
                all_received,
                ),
            Err(code) if code.transitional() => {}
            Err(code) => error!("receive phase failed: {code}"),
        }

        refresh_inputs(&context);
        context.status.bump_cycle();
        runtime.rx_data.signal();

        refresh_outputs(&context);

        for phase in [CyclePhase::SendCyclic, CyclePhase::Housekeeping, CyclePhase::SendAcyclic] {
            if let Err(code) = context.stack.exec_cycle(phase) {
                // expected while the bus state machine is in transition
                let expected = match phase {
                    CyclePhase::Housekeeping => code == crate::stack::StackError::InvalidState,
                    _ => code.transitional(),
                };
                if ! expected {
                    error!("cycle phase {phase:?} failed: {code}");
                }
            }
        }

        if context.log_clock_status {
            if let Ok(clock) = context.stack.clock_status() {
                trace!("clock deviation {} ns (avg {} ns)", clock.diff_current, clock.diff_average);
            }
        }
    }

    runtime.job_running.store(false, Ordering::SeqCst);
    runtime.stopped.signal();
}

/// overload bookkeeping for one receive phase result, returns the new score
fn update_overload(limiter: &RateLimiter, status: &BusStatus, fault_threshold: u32, overload: u32, all_received: bool) -> u32 {
    if all_received {
        if overload > 0 {
            // any clean frame restores full-rate reporting for the next loss
            limiter.reset();
            return overload - 1;
        }
        return 0;
    }

    let overload = overload.saturating_add(OVERLOAD_PENALTY);
    limiter.count();
    if limiter.on_limit() {
        warn!("reached maximum number of reports for lost cyclic frames, reducing report rate");
    }
    if limiter.should_log() {
        warn!("cyclic frames lost, overload score {overload}");
    }
    if overload >= fault_threshold {
        error!("bus overloaded, cyclic frames keep getting lost");
        status.raise_fault();
    }
    overload
}

/// copy the fresh input image into every bound input variable
fn refresh_inputs(context: &JobContext) {
    let mut skipped: heapless::Vec<usize, 64> = heapless::Vec::new();
    context.stack.input_image(&mut |image| {
        for (rank, variable) in context.variables.inputs().iter().enumerate() {
            let Some(Binding::Process {bit_offset}) = variable.binding() else {continue};
            let Some(mut state) = variable.try_lock_for(context.lock_timeout) else {
                let _ = skipped.push(rank);
                continue;
            };
            if variable.type_id() == TypeId::BOOL {
                state.bytes[0] = u8::from(get_bit(image, *bit_offset));
            }
            else {
                let bits = variable.bit_size();
                copy_bits(&mut state.bytes, 0, image, *bit_offset, bits);
            }
        }
    });
    if ! skipped.is_empty() && context.verbose {
        trace!("skipped {} input variables held by the application", skipped.len());
    }
}

/// copy every bound output variable into the output image
fn refresh_outputs(context: &JobContext) {
    let mut skipped: heapless::Vec<usize, 64> = heapless::Vec::new();
    context.stack.output_image(&mut |image| {
        for (rank, variable) in context.variables.outputs().iter().enumerate() {
            let Some(Binding::Process {bit_offset}) = variable.binding() else {continue};
            let Some(state) = variable.try_lock_for(context.lock_timeout) else {
                let _ = skipped.push(rank);
                continue;
            };
            if variable.type_id() == TypeId::BOOL {
                crate::data::set_bit(image, *bit_offset, state.bytes[0] & 0b1 == 0b1);
            }
            else {
                let bits = variable.bit_size();
                copy_bits(image, *bit_offset, &state.bytes, 0, bits);
            }
        }
    });
    if ! skipped.is_empty() && context.verbose {
        trace!("skipped {} output variables held by the application", skipped.len());
    }
}

/// switch a spawned thread to FIFO scheduling, only a warning when the platform refuses
#[cfg(target_os = "linux")]
fn make_realtime(handle: &JoinHandle<()>, priority: u8) {
    use std::os::unix::thread::JoinHandleExt;
    use thread_priority::{
        set_thread_priority_and_policy, RealtimeThreadSchedulePolicy, ThreadPriority,
        ThreadPriorityValue, ThreadSchedulePolicy,
    };

    let priority = match ThreadPriorityValue::try_from(priority) {
        Ok(value) => ThreadPriority::Crossplatform(value),
        Err(_) => ThreadPriority::Max,
    };
    if let Err(code) = set_thread_priority_and_policy(
        handle.as_pthread_t(),
        priority,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
        warn!("cannot switch thread to realtime scheduling: {code:?}");
    }
}

#[cfg(not(target_os = "linux"))]
fn make_realtime(_handle: &JoinHandle<()>, _priority: u8) {
    log::debug!("realtime scheduling not supported on this platform");
}

/// pin the calling thread to one cpu
#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("cannot pin the timing thread to cpu {cpu}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultPolicy;

    #[test]
    fn overload_escalates_and_decays() {
        let limiter = RateLimiter::new(10, 2000);
        let status = BusStatus::new(FaultPolicy::Enforce);

        let mut score = 0;
        for _ in 0 .. 4 {
            score = update_overload(&limiter, &status, 50, score, false);
        }
        assert_eq!(score, 40);
        assert!(! status.fault());
        score = update_overload(&limiter, &status, 50, score, false);
        assert_eq!(score, 50);
        assert!(status.fault());
    }

    #[test]
    fn clean_frame_restores_full_rate_reporting() {
        let limiter = RateLimiter::new(2, 2000);
        let status = BusStatus::new(FaultPolicy::Enforce);

        // enough losses to push the limiter past its threshold
        let mut score = 0;
        for _ in 0 .. 4 {
            score = update_overload(&limiter, &status, 1000, score, false);
        }
        assert!(! limiter.should_log());

        // one clean frame decrements the score and resets the limiter immediately,
        // even though the score is still positive
        score = update_overload(&limiter, &status, 1000, score, true);
        assert_eq!(score, 39);
        assert_eq!(limiter.occurrences(), 0);
        score = update_overload(&limiter, &status, 1000, score, false);
        assert_eq!(score, 49);
        assert!(limiter.should_log());
    }

    #[test]
    fn score_never_goes_below_zero() {
        let limiter = RateLimiter::new(10, 2000);
        let status = BusStatus::new(FaultPolicy::Enforce);
        assert_eq!(update_overload(&limiter, &status, 50, 0, true), 0);
    }
}
