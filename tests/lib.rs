//! Integration tests running the whole coordination master over an in-process mock stack.

use fieldlink::{
    data::{code, TypeCode},
    error::BusError,
    stack::{
        BusState, ClientId, ClockStatus, CyclePhase, DescriptionSource, Direction,
        EmergencyRecord, FieldbusStack, LinkLayer, LinkParameters, Notification, NotifyCallback,
        ProcessVarInfo, SlaveId, StackError, StackParameters, StackResult, TransferAddress,
        TransferHandle, TransferKind, WaitMode,
    },
    variable::TransferState,
    BusVar, FaultPolicy, Master, MasterConfig, Slave,
};

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use bilge::prelude::*;
use parking_lot::Mutex;


fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct NullLink;
impl LinkLayer for NullLink {
    fn parameters(&self) -> LinkParameters {
        LinkParameters {driver: "null".into(), instance: 0, polling: true}
    }
}

#[derive(Default)]
struct MockInner {
    entries: HashMap<(Direction, String), ProcessVarInfo>,
    input_image: Vec<u8>,
    output_image: Vec<u8>,
    stations: HashMap<u16, SlaveId>,
    objects: HashMap<(u32, u16, u8), Vec<u8>>,
    connected: u32,
    configured: u32,
    state: Option<BusState>,
    state_requests: Vec<BusState>,
    next_handle: u32,
    live_handles: HashSet<u32>,
    requests: Vec<(u32, TransferKind, TransferAddress)>,
    frames_ok: bool,
    next_client: u32,
    callbacks: Vec<(ClientId, NotifyCallback)>,
    deinit_calls: u32,
}

/// scriptable stand-in for the vendor stack
struct MockStack {
    inner: Mutex<MockInner>,
}

impl MockStack {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MockInner {
                input_image: vec![0; 64],
                output_image: vec![0; 64],
                frames_ok: true,
                ..MockInner::default()
            }),
        })
    }

    fn add_entry(&self, direction: Direction, name: &str, bit_offset: usize, bit_size: usize, type_code: TypeCode) {
        self.inner.lock().entries.insert(
            (direction, name.to_string()),
            ProcessVarInfo {bit_offset, bit_size, type_code},
            );
    }

    fn add_station(&self, station: u16, id: SlaveId) {
        self.inner.lock().stations.insert(station, id);
    }

    fn add_object(&self, slave: SlaveId, index: u16, sub: u8, bytes: Vec<u8>) {
        self.inner.lock().objects.insert((slave.0, index, sub), bytes);
    }

    fn set_presence(&self, connected: u32, configured: u32) {
        let mut inner = self.inner.lock();
        inner.connected = connected;
        inner.configured = configured;
    }

    fn set_state(&self, state: BusState) {
        self.inner.lock().state = Some(state);
    }

    fn set_frames_ok(&self, ok: bool) {
        self.inner.lock().frames_ok = ok;
    }

    fn write_input(&self, offset: usize, bytes: &[u8]) {
        self.inner.lock().input_image[offset ..][.. bytes.len()].copy_from_slice(bytes);
    }

    fn output_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.inner.lock().output_image[offset ..][.. len].to_vec()
    }

    fn state_requests(&self) -> Vec<BusState> {
        self.inner.lock().state_requests.clone()
    }

    fn requests(&self) -> Vec<(u32, TransferKind, TransferAddress)> {
        self.inner.lock().requests.clone()
    }

    fn live_handles(&self) -> usize {
        self.inner.lock().live_handles.len()
    }

    fn deinit_calls(&self) -> u32 {
        self.inner.lock().deinit_calls
    }

    /// push a notification to every registered client, like the vendor stack would
    fn notify(&self, notification: Notification) {
        let callbacks: Vec<NotifyCallback> = self.inner.lock().callbacks.iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(notification.clone());
        }
    }
}

impl FieldbusStack for MockStack {
    fn init(&self, _parameters: &StackParameters) -> StackResult {
        Ok(())
    }
    fn deinit(&self) -> StackResult {
        self.inner.lock().deinit_calls += 1;
        Ok(())
    }
    fn configure(&self, _description: &DescriptionSource) -> StackResult {
        Ok(())
    }

    fn register_notification_client(&self, callback: NotifyCallback) -> StackResult<ClientId> {
        let mut inner = self.inner.lock();
        inner.next_client += 1;
        let client = ClientId(inner.next_client);
        inner.callbacks.push((client, callback));
        Ok(client)
    }
    fn unregister_notification_client(&self, client: ClientId) -> StackResult {
        self.inner.lock().callbacks.retain(|(owner, _)| *owner != client);
        Ok(())
    }

    fn master_state(&self) -> BusState {
        self.inner.lock().state.unwrap_or(BusState::Unknown)
    }
    fn set_master_state(&self, state: BusState, _wait: WaitMode) -> StackResult {
        let mut inner = self.inner.lock();
        inner.state_requests.push(state);
        inner.state = Some(state);
        Ok(())
    }
    fn clock_status(&self) -> StackResult<ClockStatus> {
        Ok(ClockStatus::default())
    }

    fn find_variable(&self, direction: Direction, name: &str) -> StackResult<ProcessVarInfo> {
        self.inner.lock().entries
            .get(&(direction, name.to_string()))
            .copied()
            .ok_or(StackError::NotFound)
    }

    fn exec_cycle(&self, phase: CyclePhase) -> StackResult<bool> {
        match phase {
            CyclePhase::ReceiveFrames => Ok(self.inner.lock().frames_ok),
            _ => Ok(true),
        }
    }
    fn input_image(&self, read: &mut dyn FnMut(&[u8])) {
        let inner = self.inner.lock();
        read(&inner.input_image);
    }
    fn output_image(&self, write: &mut dyn FnMut(&mut [u8])) {
        let mut inner = self.inner.lock();
        write(&mut inner.output_image);
    }

    fn create_mailbox_transfer(&self, _max_len: usize) -> StackResult<TransferHandle> {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.live_handles.insert(handle);
        Ok(TransferHandle(handle))
    }
    fn delete_mailbox_transfer(&self, handle: TransferHandle) -> StackResult {
        if self.inner.lock().live_handles.remove(&handle.0) {Ok(())}
        else {Err(StackError::NotFound)}
    }
    fn request_download(
        &self,
        _client: ClientId,
        handle: TransferHandle,
        transfer_id: u32,
        address: TransferAddress,
        _data: &[u8],
        _timeout: Duration,
    ) -> StackResult {
        let mut inner = self.inner.lock();
        if ! inner.live_handles.contains(&handle.0)
            {return Err(StackError::NotFound)}
        inner.requests.push((transfer_id, TransferKind::Download, address));
        Ok(())
    }
    fn request_upload(
        &self,
        _client: ClientId,
        handle: TransferHandle,
        transfer_id: u32,
        address: TransferAddress,
        _timeout: Duration,
    ) -> StackResult {
        let mut inner = self.inner.lock();
        if ! inner.live_handles.contains(&handle.0)
            {return Err(StackError::NotFound)}
        inner.requests.push((transfer_id, TransferKind::Upload, address));
        Ok(())
    }
    fn sync_download(&self, address: TransferAddress, data: &[u8], _timeout: Duration) -> StackResult {
        let mut inner = self.inner.lock();
        match inner.objects.get_mut(&(address.slave.0, address.index, address.sub)) {
            Some(stored) => {
                *stored = data.to_vec();
                Ok(())
            }
            None => Err(StackError::NotFound),
        }
    }
    fn sync_upload(&self, address: TransferAddress, data: &mut [u8], _timeout: Duration) -> StackResult<usize> {
        let inner = self.inner.lock();
        match inner.objects.get(&(address.slave.0, address.index, address.sub)) {
            Some(stored) => {
                let copied = stored.len().min(data.len());
                data[.. copied].copy_from_slice(&stored[.. copied]);
                // reports the full object length, like the vendor stack does
                Ok(stored.len())
            }
            None => Err(StackError::NotFound),
        }
    }

    fn connected_slaves(&self) -> u32 {
        self.inner.lock().connected
    }
    fn configured_slaves(&self) -> u32 {
        self.inner.lock().configured
    }
    fn resolve_slave(&self, station: u16) -> Option<SlaveId> {
        self.inner.lock().stations.get(&station).copied()
    }
}

fn test_config() -> MasterConfig {
    MasterConfig {
        cycle_time: Duration::from_millis(1),
        fault_policy: FaultPolicy::Enforce,
        startup_timeout: Duration::from_secs(5),
        recovery_timeout: Duration::from_millis(10),
        ..MasterConfig::default()
    }
}

fn started_master(stack: Arc<MockStack>, config: MasterConfig) -> Master {
    let mut master = Master::new(stack, Box::new(NullLink), config);
    master.init().unwrap();
    master.configure(&DescriptionSource::File(PathBuf::from("machine.xml"))).unwrap();
    master
}


#[test]
fn binding_checks_type_and_size() {
    init_logging();
    let stack = MockStack::new();
    stack.add_entry(Direction::Input, "Drive1.Inputs.Velocity", 32, 32, code::INTEGER32);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    // wrong rust type for the declared entry
    let wrong_type = BusVar::<u32>::input();
    assert_eq!(
        master.bind_process_variable(&drive, "Inputs.Velocity", &wrong_type),
        Err(BusError::TypeMismatch),
        );
    assert!(! wrong_type.bound());

    // wrong size
    let wrong_size = BusVar::<i16>::input();
    assert_eq!(
        master.bind_process_variable(&drive, "Inputs.Velocity", &wrong_size),
        Err(BusError::TypeMismatch),
        );
    assert!(! wrong_size.bound());

    // unknown entry
    let missing = BusVar::<i32>::input();
    assert!(matches!(
        master.bind_process_variable(&drive, "Inputs.Torque", &missing),
        Err(BusError::Binding(_)),
        ));
    assert!(! missing.bound());

    // matching declaration binds
    let velocity = BusVar::<i32>::input();
    master.bind_process_variable(&drive, "Inputs.Velocity", &velocity).unwrap();
    assert!(velocity.bound());
}

#[test]
fn input_variable_follows_the_image() {
    init_logging();
    let stack = MockStack::new();
    stack.add_entry(Direction::Input, "Drive1.Inputs.Status", 16, 16, code::UNSIGNED16);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    let status = BusVar::<u16>::input();
    master.bind_process_variable(&drive, "Inputs.Status", &status).unwrap();

    stack.write_input(2, &0x1234u16.to_le_bytes());
    // two full cycles so the write is guaranteed to be picked up
    master.wait_for_bus_rx_data();
    master.wait_for_bus_rx_data();
    assert_eq!(status.get(), 0x1234);
}

#[test]
fn boolean_input_extracts_a_single_bit() {
    init_logging();
    let stack = MockStack::new();
    stack.add_entry(Direction::Input, "Drive1.Inputs.Homed", 13, 1, code::BOOLEAN);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    let homed = BusVar::<bool>::input();
    master.bind_process_variable(&drive, "Inputs.Homed", &homed).unwrap();

    // every neighbour bit set, target bit clear
    stack.write_input(1, &[0b1101_1111]);
    master.wait_for_bus_rx_data();
    master.wait_for_bus_rx_data();
    assert!(! homed.get());

    stack.write_input(1, &[0b0010_0000]);
    master.wait_for_bus_rx_data();
    master.wait_for_bus_rx_data();
    assert!(homed.get());
}

#[test]
fn output_variable_reaches_the_image() {
    init_logging();
    let stack = MockStack::new();
    stack.add_entry(Direction::Output, "Drive1.Outputs.Target", 24, 32, code::INTEGER32);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    let target = BusVar::<i32>::output();
    master.bind_process_variable(&drive, "Outputs.Target", &target).unwrap();

    target.set(-559038737);
    master.wait_for_bus_rx_data();
    master.wait_for_bus_rx_data();
    assert_eq!(stack.output_bytes(3, 4), (-559038737i32).to_le_bytes());
}

#[test]
fn async_transfer_lifecycle() {
    init_logging();
    let stack = MockStack::new();
    stack.add_station(1001, SlaveId(3));
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    let mode = BusVar::<u8>::mailbox();
    master.bind_mailbox_variable(&drive, 0x6060, 0, &mode).unwrap();
    assert_eq!(stack.live_handles(), 1);

    mode.set(8);
    master.download(&mode).unwrap();
    assert_eq!(mode.transfer_state(), TransferState::InProgress);

    // a second request on the same variable is refused until completion
    assert_eq!(master.download(&mode), Err(BusError::TransferInProgress));

    let (transfer_id, kind, address) = stack.requests()[0];
    assert_eq!(kind, TransferKind::Download);
    assert_eq!(address, TransferAddress {slave: SlaveId(3), index: 0x6060, sub: 0});

    stack.notify(Notification::MailboxCompleted {
        handle: TransferHandle(1),
        transfer_id,
        kind,
        error: None,
    });
    assert_eq!(mode.transfer_state(), TransferState::Done);
    assert!(! master.fault());

    // a failing completion marks the transfer failed
    master.upload(&mode).unwrap();
    let (transfer_id, kind, _) = stack.requests()[1];
    assert_eq!(kind, TransferKind::Upload);
    stack.notify(Notification::MailboxCompleted {
        handle: TransferHandle(1),
        transfer_id,
        kind,
        error: Some(StackError::Aborted(0x0601_0000)),
    });
    assert_eq!(mode.transfer_state(), TransferState::Failed);
}

#[test]
fn shutdown_releases_stack_resources() {
    init_logging();
    let stack = MockStack::new();
    stack.add_station(1001, SlaveId(3));
    let mut master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    let mode = BusVar::<u8>::mailbox();
    master.bind_mailbox_variable(&drive, 0x6060, 0, &mode).unwrap();
    assert_eq!(stack.live_handles(), 1);

    master.shutdown();
    assert_eq!(stack.live_handles(), 0);
    assert_eq!(stack.deinit_calls(), 1);
    assert_eq!(stack.state_requests().last(), Some(&BusState::Init));
}

#[test]
fn sync_transfers_and_their_failures() {
    init_logging();
    let stack = MockStack::new();
    stack.add_station(1001, SlaveId(3));
    stack.add_object(SlaveId(3), 0x1018, 4, vec![0, 0, 0, 0]);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    master.sync_download(&drive, 0x1018, 4, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
    let mut buffer = [0u8; 8];
    assert_eq!(master.sync_upload(&drive, 0x1018, 4, &mut buffer).unwrap(), 4);
    assert_eq!(&buffer[.. 4], &[0xaa, 0xbb, 0xcc, 0xdd]);
    assert!(! master.fault());

    // unknown object raises the sticky fault
    assert_eq!(
        master.sync_upload(&drive, 0x2000, 0, &mut buffer),
        Err(BusError::TransferFailed(StackError::NotFound)),
        );
    assert!(master.fault());
}

#[test]
fn emergency_objects_route_by_station() {
    init_logging();
    let stack = MockStack::new();
    stack.add_station(1001, SlaveId(3));
    stack.add_station(1002, SlaveId(4));
    let master = started_master(stack.clone(), test_config());
    let drive1 = Slave::new("Drive1", 1001);
    let drive2 = Slave::new("Drive2", 1002);

    let emergency1 = BusVar::emergency();
    let emergency2 = BusVar::emergency();
    master.bind_mailbox_variable(&drive1, 0, 0, &emergency1).unwrap();
    master.bind_mailbox_variable(&drive2, 0, 0, &emergency2).unwrap();
    // emergency variables allocate no transfer object
    assert_eq!(stack.live_handles(), 0);

    let record = EmergencyRecord::new(0x8130, 0x81, u40::new(0x0102030405));
    stack.notify(Notification::Emergency {station: 1002, record});

    assert_eq!(emergency2.get(), record.to_bytes());
    assert_eq!(emergency2.transfer_state(), TransferState::Done);
    assert_eq!(emergency1.get(), [0u8; 8]);
    assert!(master.fault());
}

#[test]
fn oversized_upload_report_is_a_contract_violation() {
    init_logging();
    let stack = MockStack::new();
    stack.add_station(1001, SlaveId(3));
    stack.add_object(SlaveId(3), 0x1008, 0, vec![0x41; 16]);
    let master = started_master(stack.clone(), test_config());
    let drive = Slave::new("Drive1", 1001);

    // the stack reports more bytes than the caller's buffer can hold
    let mut buffer = [0u8; 8];
    assert_eq!(
        master.sync_upload(&drive, 0x1008, 0, &mut buffer),
        Err(BusError::Protocol("upload length exceeds the destination buffer")),
        );
    assert!(master.fault());
}

#[test]
fn protocol_violations_raise_fault() {
    init_logging();
    let stack = MockStack::new();
    let master = started_master(stack.clone(), test_config());
    assert!(! master.fault());

    // an event code this layer does not know about is fatal
    stack.notify(Notification::Unknown {code: 0x00ff_0000});
    assert!(master.fault());
    master.reset_fault();
    assert!(! master.fault());

    // so is the stack dropping our registration
    stack.notify(Notification::ClientRegistrationDropped);
    assert!(master.fault());
}

#[test]
fn operational_drop_raises_fault_and_comeback_clears_the_symptom() {
    init_logging();
    let stack = MockStack::new();
    let master = started_master(stack.clone(), test_config());

    stack.notify(Notification::NotAllOperational);
    assert!(master.fault());

    stack.notify(Notification::AllOperational);
    // the comeback clears the symptom, the sticky fault stays until reset
    assert!(master.fault());
    master.reset_fault();
    assert!(! master.fault());
}

#[test]
fn recovery_steps_down_then_up() {
    init_logging();
    let stack = MockStack::new();
    stack.set_presence(3, 4);
    stack.set_state(BusState::Op);
    let master = started_master(stack.clone(), test_config());

    master.request_state(BusState::Op, false).unwrap();
    stack.notify(Notification::NotAllOperational);
    master.reset_fault();

    // one slave missing while in OP: step down
    master.process();
    assert_eq!(stack.state_requests().last(), Some(&BusState::SafeOp));

    // the hold-off window blocks an immediate second attempt
    master.process();
    assert_eq!(stack.master_state(), BusState::SafeOp);
    thread::sleep(Duration::from_millis(20));

    // the missing slave is back: restart through INIT
    stack.set_presence(4, 4);
    master.process();
    assert_eq!(stack.master_state(), BusState::Init);
    thread::sleep(Duration::from_millis(20));

    // and back up to the requested state
    master.process();
    assert_eq!(stack.master_state(), BusState::Op);
    let requests = stack.state_requests();
    assert_eq!(&requests[requests.len() - 3 ..], &[BusState::SafeOp, BusState::Init, BusState::Op]);
}

#[test]
fn lost_cyclic_frames_escalate_to_fault() {
    init_logging();
    let stack = MockStack::new();
    let master = started_master(stack.clone(), test_config());
    assert!(! master.fault());

    // +10 per lost cycle, fault at 50: a few milliseconds of losses are enough
    stack.set_frames_ok(false);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while ! master.fault() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(master.fault());
}

#[test]
fn bus_time_binds_when_the_description_carries_it() {
    init_logging();
    let stack = MockStack::new();
    stack.add_entry(Direction::Input, "Inputs.BusTime", 0, 32, code::UNSIGNED32);
    let master = started_master(stack.clone(), test_config());

    stack.write_input(0, &0x0065_4321u32.to_le_bytes());
    master.wait_for_bus_rx_data();
    master.wait_for_bus_rx_data();
    assert_eq!(master.bus_time(), 0x0065_4321);
}
