/*!
    Interfaces to the underlying fieldbus master stack and its link layer.

    The coordination core does not talk to the wire itself: it drives a vendor master stack
    through [FieldbusStack] and receives its asynchronous events through a registered
    callback. Everything in this module is the contract of that boundary, implementations
    live outside this crate (a vendor binding in production, a mock in the test suite).
*/

use crate::data::TypeCode;

use core::fmt;
use std::{path::PathBuf, sync::Arc, time::Duration};

use bilge::prelude::*;
use thiserror::Error;


/// state of the bus as reported by the stack
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BusState {
    /// not yet reported, or reported as none of the operative states
    Unknown,
    Init,
    PreOp,
    SafeOp,
    Op,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "UNKNOWN",
            Self::Init => "INIT",
            Self::PreOp => "PREOP",
            Self::SafeOp => "SAFEOP",
            Self::Op => "OP",
        })
    }
}

/// whether a state change request shall wait for completion
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitMode {
    /// block until the bus reached the state, or the duration elapsed
    Block(Duration),
    /// issue the request and return immediately
    NoWait,
}

/// direction of a process data entry, seen from the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// slave to master
    Input,
    /// master to slave
    Output,
}

/**
    the successive phases of one bus cycle, in the order the job thread runs them

    the stack requires these to be invoked from a single thread, once per cycle each
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CyclePhase {
    /// process frames received since the last cycle
    ReceiveFrames,
    /// queue the cyclic process data frames for transmission
    SendCyclic,
    /// stack-internal housekeeping (state machines, watchdogs)
    Housekeeping,
    /// queue pending acyclic (mailbox) frames
    SendAcyclic,
}

/// description of one process data entry found in the bus configuration
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProcessVarInfo {
    /// offset of the entry in the process image, in bits
    pub bit_offset: usize,
    /// size of the entry, in bits
    pub bit_size: usize,
    /// electronic type code declared for the entry
    pub type_code: TypeCode,
}

/// stack-internal identifier of a configured slave
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlaveId(pub u32);

/// opaque handle to a preallocated mailbox transfer object
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TransferHandle(pub u32);

/// identifier of a registered notification client
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(pub u32);

/// addressing of one mailbox object on one slave
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TransferAddress {
    pub slave: SlaveId,
    pub index: u16,
    pub sub: u8,
}

/// direction of a mailbox transfer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    /// master to slave
    Download,
    /// slave to master
    Upload,
}

/// clock synchronization diagnostic snapshot
#[derive(Copy, Clone, Debug, Default)]
pub struct ClockStatus {
    /// vendor status code, 0 when in sync
    pub status: u32,
    /// current deviation to the reference clock, nanoseconds
    pub diff_current: i32,
    /// average deviation, nanoseconds
    pub diff_average: i32,
    /// worst deviation since last reset, nanoseconds
    pub diff_max: i32,
}

/// error reported by a stack call
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum StackError {
    #[error("stack is not in a state allowing the operation")]
    InvalidState,
    #[error("link layer is disconnected")]
    LinkDisconnected,
    #[error("stack operation timed out")]
    Timeout,
    #[error("requested item was not found")]
    NotFound,
    #[error("transfer aborted by the slave, code 0x{0:08x}")]
    Aborted(u32),
    #[error("stack operation failed, vendor code 0x{0:08x}")]
    Failed(u32),
}

impl StackError {
    /**
        true for results that are expected while the bus state machine is in transition
        and must not trip the master fault
    */
    pub fn transitional(self) -> bool {
        matches!(self, Self::InvalidState | Self::LinkDisconnected)
    }
}

pub type StackResult<T = ()> = Result<T, StackError>;

/// kind of a frame-level response error
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameErrorKind {
    /// no response received in time
    NoResponse,
    /// response carried an unexpected frame index
    WrongIndex,
    /// unsolicited response
    Unexpected,
    /// frame is being retried
    Retry,
    /// all retries exhausted
    RetryFailed,
}

/**
    fixed 8 byte record carried by an emergency object

    layout on the wire: error code (2 bytes, little endian), error register (1 byte),
    manufacturer data (5 bytes)
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, PartialEq)]
pub struct EmergencyRecord {
    pub error_code: u16,
    pub error_register: u8,
    pub data: u40,
}

impl EmergencyRecord {
    /// record as it appears on the wire
    pub fn to_bytes(self) -> [u8; 8] {
        u64::from(self).to_le_bytes()
    }
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self::from(u64::from_le_bytes(bytes))
    }
}

/**
    asynchronous event reported by the stack

    delivered to the callback passed to [FieldbusStack::register_notification_client],
    possibly from stack-internal threads.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// bus state machine moved
    StateChanged {old: BusState, new: BusState},
    LinkConnected,
    LinkDisconnected,
    /// bus scan finished, with the number of slaves found
    ScanCompleted {result: Result<u32, StackError>},
    /// a slave appeared on the segment
    SlaveAppeared {station: u16},
    /// a slave vanished from the segment
    SlaveVanished {station: u16},
    /// a slave's process data watchdog expired
    WatchdogExpired {station: u16},
    /// crossed tx/rx lines detected at a slave port
    LineCrossed {station: u16},
    /// redundancy/junction topology change at a slave
    JunctionChanged {station: u16, line_break: bool},
    /// a cyclic frame came back with a wrong working counter
    WorkingCounterMismatch {command: u8, address: u32, expected: u16, actual: u16},
    /// a frame-level response error
    FrameResponse {cyclic: bool, kind: FrameErrorKind},
    /// a slave reported an error in its status registers
    SlaveError {station: u16, status: u16, code: u16},
    /// a mailbox init command was aborted during a state transition
    InitCommandAborted {station: u16, index: u16, sub: u8, code: u32},
    /// an asynchronous mailbox transfer finished
    MailboxCompleted {
        handle: TransferHandle,
        transfer_id: u32,
        kind: TransferKind,
        /// `None` for success
        error: Option<StackError>,
    },
    /// a slave pushed an emergency object
    Emergency {station: u16, record: EmergencyRecord},
    /// at least one configured slave left OP
    NotAllOperational,
    /// every configured slave is back in OP
    AllOperational,
    /// the stack dropped our notification registration
    ClientRegistrationDropped,
    /// vendor code this crate does not know about
    Unknown {code: u32},
}

/// notification callback, invoked from stack-internal threads
pub type NotifyCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// where the bus configuration comes from
#[derive(Clone, Debug)]
pub enum DescriptionSource {
    /// path to a bus description file
    File(PathBuf),
    /// in-memory bus description
    Bytes(Vec<u8>),
}

/// parameters handed to the link layer driver
#[derive(Clone, Debug)]
pub struct LinkParameters {
    /// driver identifier, vendor-defined
    pub driver: String,
    /// adapter instance for the driver
    pub instance: u32,
    /// true to poll the adapter from the job thread instead of using interrupts
    pub polling: bool,
}

/// everything the stack needs at initialization
#[derive(Clone, Debug)]
pub struct StackParameters {
    pub link: LinkParameters,
    /// bus cycle period
    pub cycle_time: Duration,
    /// maximum number of slaves the stack shall support
    pub max_slaves: u32,
    /// enable distributed clock synchronization
    pub distributed_clocks: bool,
    /// optional mailbox protocols to enable
    pub protocols: crate::config::ProtocolSupport,
}

/**
    link layer driver descriptor

    only provides the opaque adapter parameters the stack needs, the driver itself is
    loaded by the stack
*/
pub trait LinkLayer: Send + Sync {
    fn parameters(&self) -> LinkParameters;
}

/**
    the vendor master stack driven by [crate::master::Master]

    Thread safety: every method may be called from any thread unless noted. [Self::exec_cycle]
    and the image accessors must only be called from the job thread.
*/
pub trait FieldbusStack: Send + Sync {
    /// bring the stack up on the given link
    fn init(&self, parameters: &StackParameters) -> StackResult;
    /// tear the stack down, counterpart of [Self::init]
    fn deinit(&self) -> StackResult;
    /// load the bus description and build the process image layout
    fn configure(&self, description: &DescriptionSource) -> StackResult;

    /// register a callback receiving every asynchronous event
    fn register_notification_client(&self, callback: NotifyCallback) -> StackResult<ClientId>;
    fn unregister_notification_client(&self, client: ClientId) -> StackResult;

    /// current state of the bus state machine
    fn master_state(&self) -> BusState;
    /// request a bus state, optionally waiting for completion
    fn set_master_state(&self, state: BusState, wait: WaitMode) -> StackResult;
    /// clock synchronization diagnostic
    fn clock_status(&self) -> StackResult<ClockStatus>;

    /// look up a process data entry by its full symbolic name
    fn find_variable(&self, direction: Direction, name: &str) -> StackResult<ProcessVarInfo>;

    /**
        run one phase of the bus cycle, job thread only

        for [CyclePhase::ReceiveFrames] the returned boolean is true when the cyclic frames
        of the previous cycle all came back, false when at least one was lost
    */
    fn exec_cycle(&self, phase: CyclePhase) -> StackResult<bool>;
    /// expose the input process image to the given reader, job thread only
    fn input_image(&self, read: &mut dyn FnMut(&[u8]));
    /// expose the output process image to the given writer, job thread only
    fn output_image(&self, write: &mut dyn FnMut(&mut [u8]));

    /// preallocate a mailbox transfer object able to carry `max_len` bytes
    fn create_mailbox_transfer(&self, max_len: usize) -> StackResult<TransferHandle>;
    fn delete_mailbox_transfer(&self, handle: TransferHandle) -> StackResult;
    /**
        queue an asynchronous mailbox download, completion is reported through
        [Notification::MailboxCompleted] with the same `transfer_id`
    */
    fn request_download(
        &self,
        client: ClientId,
        handle: TransferHandle,
        transfer_id: u32,
        address: TransferAddress,
        data: &[u8],
        timeout: Duration,
    ) -> StackResult;
    /// queue an asynchronous mailbox upload
    fn request_upload(
        &self,
        client: ClientId,
        handle: TransferHandle,
        transfer_id: u32,
        address: TransferAddress,
        timeout: Duration,
    ) -> StackResult;
    /// blocking mailbox download
    fn sync_download(&self, address: TransferAddress, data: &[u8], timeout: Duration) -> StackResult;
    /// blocking mailbox upload, returns the received length
    fn sync_upload(&self, address: TransferAddress, data: &mut [u8], timeout: Duration) -> StackResult<usize>;

    /// number of slaves currently present on the segment
    fn connected_slaves(&self) -> u32;
    /// number of slaves the bus description declares
    fn configured_slaves(&self) -> u32;
    /// resolve a station address to the stack-internal slave id
    fn resolve_slave(&self, station: u16) -> Option<SlaveId>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emergency_record_wire_layout() {
        let record = EmergencyRecord::new(0x8130, 0x81, u40::new(0x0102030405));
        assert_eq!(record.to_bytes(), [0x30, 0x81, 0x81, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(EmergencyRecord::from_bytes(record.to_bytes()), record);
        assert_eq!(record.error_code(), 0x8130);
        assert_eq!(record.error_register(), 0x81);
    }

    #[test]
    fn transitional_errors() {
        assert!(StackError::InvalidState.transitional());
        assert!(StackError::LinkDisconnected.transitional());
        assert!(! StackError::Timeout.transitional());
        assert!(! StackError::Aborted(0x06010000).transitional());
    }
}
