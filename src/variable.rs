/*!
    Application-side bus variables.

    A [BusVariable] is the untyped shared core: declared type and size, access mode, the
    write-once binding to a bus entry, and the value bytes guarded by a lock with bounded
    acquisition. [BusVar] is the typed handle the application actually holds, cheap to clone
    and safe to pass between threads.
*/

use crate::{
    data::{BusData, TypeId},
    error::{BusError, BusResult},
    stack::{TransferAddress, TransferHandle},
};

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

/// how the variable is exchanged with the bus
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// cyclic process data, slave to master
    Input,
    /// cyclic process data, master to slave
    Output,
    /// acyclic transfers through the slave mailbox
    Mailbox,
}

/// status of the asynchronous transfer attached to a mailbox variable
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferState {
    /// no transfer issued yet, or status consumed
    Idle,
    InProgress,
    Done,
    Failed,
}

/// attachment of a variable to its bus entry, written once at bind time
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Binding {
    /// cyclic entry at a fixed position in the process image
    Process {bit_offset: usize},
    /// ordinary mailbox object with its preallocated transfer
    Mailbox {handle: TransferHandle, address: TransferAddress},
    /// receives emergency objects pushed by the given station
    Emergency {station: u16},
}

/// value bytes and transfer bookkeeping, everything that needs the lock
pub struct VariableState {
    pub bytes: Box<[u8]>,
    pub transfer: TransferState,
    pub transfer_id: u32,
}

/// untyped core shared between a [BusVar] handle and the realtime machinery
pub struct BusVariable {
    ty: TypeId,
    bits: usize,
    mode: AccessMode,
    emergency: bool,
    binding: OnceLock<Binding>,
    state: Mutex<VariableState>,
}

impl BusVariable {
    pub fn new(ty: TypeId, bits: usize, mode: AccessMode, emergency: bool) -> Self {
        Self {
            ty,
            bits,
            mode,
            emergency,
            binding: OnceLock::new(),
            state: Mutex::new(VariableState {
                bytes: vec![0; bits.div_ceil(8)].into_boxed_slice(),
                transfer: TransferState::Idle,
                transfer_id: 0,
            }),
        }
    }

    pub fn type_id(&self) -> TypeId {self.ty}
    /// declared size on the bus, in bits
    pub fn bit_size(&self) -> usize {self.bits}
    /// size of the value buffer, in bytes
    pub fn byte_size(&self) -> usize {self.bits.div_ceil(8)}
    pub fn mode(&self) -> AccessMode {self.mode}
    /// true for the well-known event object variables
    pub fn is_emergency(&self) -> bool {self.emergency}

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.get()
    }

    /// attach the variable to its bus entry, only possible once
    pub(crate) fn bind(&self, binding: Binding) -> BusResult {
        self.binding.set(binding)
            .map_err(|_| BusError::Binding("variable is already bound"))
    }

    /// blocking lock, application threads only
    pub fn lock(&self) -> MutexGuard<'_, VariableState> {
        self.state.lock()
    }

    /// bounded-wait lock, the realtime path skips the variable on `None`
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, VariableState>> {
        self.state.try_lock_for(timeout)
    }

    pub fn transfer_state(&self) -> TransferState {
        self.state.lock().transfer
    }
}

/**
    typed handle over a shared [BusVariable]

    `T` fixes the declared type and size at construction. Handles clone freely, every clone
    refers to the same value bytes and binding.
*/
pub struct BusVar<T: BusData> {
    core: Arc<BusVariable>,
    extract: core::marker::PhantomData<fn() -> T>,
}

impl<T: BusData> Clone for BusVar<T> {
    fn clone(&self) -> Self {
        Self {core: self.core.clone(), extract: core::marker::PhantomData}
    }
}

impl<T: BusData> BusVar<T> {
    fn with_mode(mode: AccessMode) -> Self {
        Self {
            core: Arc::new(BusVariable::new(T::ID, T::BITS, mode, false)),
            extract: core::marker::PhantomData,
        }
    }

    /// cyclic input variable, slave to master
    pub fn input() -> Self {Self::with_mode(AccessMode::Input)}
    /// cyclic output variable, master to slave
    pub fn output() -> Self {Self::with_mode(AccessMode::Output)}
    /// acyclic mailbox variable
    pub fn mailbox() -> Self {Self::with_mode(AccessMode::Mailbox)}

    pub(crate) fn core(&self) -> &Arc<BusVariable> {
        &self.core
    }

    /// current value, blocking lock
    pub fn get(&self) -> T {
        let state = self.core.lock();
        // buffer is sized from T at construction, unpack cannot fail
        T::unpack(&state.bytes).ok().unwrap()
    }

    /// overwrite the value, blocking lock
    pub fn set(&self, value: T) {
        let mut state = self.core.lock();
        let _ = value.pack(&mut state.bytes);
    }

    /// current value with a bounded lock wait, [BusError::Timeout] when contended
    pub fn try_get_for(&self, timeout: Duration) -> BusResult<T> {
        let state = self.core.try_lock_for(timeout)
            .ok_or(BusError::Timeout("variable lock"))?;
        T::unpack(&state.bytes)
            .map_err(|_| BusError::Master("variable buffer does not fit its type"))
    }

    /// overwrite the value with a bounded lock wait, the variable is untouched on timeout
    pub fn try_set_for(&self, timeout: Duration, value: T) -> BusResult {
        let mut state = self.core.try_lock_for(timeout)
            .ok_or(BusError::Timeout("variable lock"))?;
        value.pack(&mut state.bytes)
            .map_err(|_| BusError::Master("variable buffer does not fit its type"))
    }

    /// status of the asynchronous transfer on this variable
    pub fn transfer_state(&self) -> TransferState {
        self.core.transfer_state()
    }

    pub fn bound(&self) -> bool {
        self.core.binding().is_some()
    }
}

impl BusVar<[u8; 8]> {
    /**
        variable receiving emergency objects from one station

        must be bound with the object index slot unused, see
        [crate::master::Master::bind_mailbox_variable]
    */
    pub fn emergency() -> Self {
        Self {
            core: Arc::new(BusVariable::new(TypeId::ARRAY, 64, AccessMode::Mailbox, true)),
            extract: core::marker::PhantomData,
        }
    }
}

/// every bound variable, grouped by access mode for the realtime and notification paths
#[derive(Default)]
pub struct VariableSet {
    inputs: RwLock<Vec<Arc<BusVariable>>>,
    outputs: RwLock<Vec<Arc<BusVariable>>>,
    mailbox: RwLock<Vec<Arc<BusVariable>>>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// record a freshly bound variable, binding must be set already
    pub(crate) fn register(&self, variable: Arc<BusVariable>) {
        match variable.mode() {
            AccessMode::Input => self.inputs.write().push(variable),
            AccessMode::Output => self.outputs.write().push(variable),
            AccessMode::Mailbox => self.mailbox.write().push(variable),
        }
    }

    pub fn inputs(&self) -> RwLockReadGuard<'_, Vec<Arc<BusVariable>>> {
        self.inputs.read()
    }
    pub fn outputs(&self) -> RwLockReadGuard<'_, Vec<Arc<BusVariable>>> {
        self.outputs.read()
    }
    pub fn mailbox(&self) -> RwLockReadGuard<'_, Vec<Arc<BusVariable>>> {
        self.mailbox.read()
    }

    /// mailbox variable owning the given transfer handle
    pub fn find_transfer(&self, handle: TransferHandle) -> Option<Arc<BusVariable>> {
        self.mailbox.read().iter()
            .find(|variable| matches!(
                variable.binding(),
                Some(Binding::Mailbox {handle: owned, ..}) if *owned == handle,
                ))
            .cloned()
    }

    /// emergency variable listening to the given station
    pub fn find_emergency(&self, station: u16) -> Option<Arc<BusVariable>> {
        self.mailbox.read().iter()
            .find(|variable| matches!(
                variable.binding(),
                Some(Binding::Emergency {station: owned}) if *owned == station,
                ))
            .cloned()
    }
}
