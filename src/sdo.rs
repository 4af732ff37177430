/*!
    Acyclic mailbox transfers between application variables and slave object dictionaries.

    Asynchronous transfers carry their completion through [crate::stack::Notification]
    events matched back to the variable by transfer id, synchronous transfers block the
    calling thread for at most the configured timeout. Both run on non-realtime threads,
    the job thread only forwards the queued frames.
*/

use crate::{
    error::{BusError, BusResult},
    slave::Slave,
    stack::{ClientId, FieldbusStack, TransferAddress},
    status::BusStatus,
    variable::{Binding, BusVariable, TransferState},
};

use core::sync::atomic::{AtomicU32, Ordering};
use std::{sync::Arc, time::Duration};

use log::{error, warn};

/// drives mailbox transfers and owns the transfer id sequence
pub struct SdoTransferManager {
    stack: Arc<dyn FieldbusStack>,
    client: ClientId,
    status: Arc<BusStatus>,
    timeout: Duration,
    sequence: AtomicU32,
}

impl SdoTransferManager {
    pub fn new(stack: Arc<dyn FieldbusStack>, client: ClientId, status: Arc<BusStatus>, timeout: Duration) -> Self {
        Self {
            stack,
            client,
            status,
            timeout,
            sequence: AtomicU32::new(0),
        }
    }

    /// fresh transfer id, never 0
    fn next_transfer_id(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    fn mailbox_binding(variable: &BusVariable) -> BusResult<(crate::stack::TransferHandle, TransferAddress)> {
        match variable.binding() {
            Some(Binding::Mailbox {handle, address}) => Ok((*handle, *address)),
            Some(Binding::Emergency {..}) =>
                Err(BusError::Master("emergency variables cannot be transferred explicitly")),
            _ => Err(BusError::Master("variable is not bound to a mailbox object")),
        }
    }

    /**
        queue an asynchronous download of the variable's current bytes

        rejected with [BusError::TransferInProgress] while the previous transfer on this
        variable has not completed
    */
    pub fn download(&self, variable: &BusVariable) -> BusResult {
        let (handle, address) = Self::mailbox_binding(variable)?;
        let mut state = variable.lock();
        if state.transfer == TransferState::InProgress {
            warn!("download rejected on 0x{:04x}.{}: transfer still in progress", address.index, address.sub);
            return Err(BusError::TransferInProgress);
        }
        let id = self.next_transfer_id();
        state.transfer_id = id;
        state.transfer = TransferState::Idle;
        if let Err(code) = self.stack.request_download(self.client, handle, id, address, &state.bytes, self.timeout) {
            error!("cannot queue download of 0x{:04x}.{}: {code}", address.index, address.sub);
            state.transfer = TransferState::Failed;
            self.status.raise_fault();
            return Err(BusError::Stack(code));
        }
        state.transfer = TransferState::InProgress;
        Ok(())
    }

    /// queue an asynchronous upload into the variable, same progress rules as [Self::download]
    pub fn upload(&self, variable: &BusVariable) -> BusResult {
        let (handle, address) = Self::mailbox_binding(variable)?;
        let mut state = variable.lock();
        if state.transfer == TransferState::InProgress {
            warn!("upload rejected on 0x{:04x}.{}: transfer still in progress", address.index, address.sub);
            return Err(BusError::TransferInProgress);
        }
        let id = self.next_transfer_id();
        state.transfer_id = id;
        state.transfer = TransferState::Idle;
        if let Err(code) = self.stack.request_upload(self.client, handle, id, address, self.timeout) {
            error!("cannot queue upload of 0x{:04x}.{}: {code}", address.index, address.sub);
            state.transfer = TransferState::Failed;
            self.status.raise_fault();
            return Err(BusError::Stack(code));
        }
        state.transfer = TransferState::InProgress;
        Ok(())
    }

    /// blocking download of raw bytes to one object, bypassing any variable
    pub fn sync_download(&self, slave: &Slave, index: u16, sub: u8, data: &[u8]) -> BusResult {
        let address = self.address(slave, index, sub)?;
        self.stack.sync_download(address, data, self.timeout)
            .map_err(|code| {
                error!("synchronous download of {}.0x{index:04x}.{sub} failed: {code}", slave.name());
                self.status.raise_fault();
                BusError::TransferFailed(code)
            })
    }

    /// blocking upload of one object into the given buffer, returns the received length
    pub fn sync_upload(&self, slave: &Slave, index: u16, sub: u8, data: &mut [u8]) -> BusResult<usize> {
        let address = self.address(slave, index, sub)?;
        let received = self.stack.sync_upload(address, data, self.timeout)
            .map_err(|code| {
                error!("synchronous upload of {}.0x{index:04x}.{sub} failed: {code}", slave.name());
                self.status.raise_fault();
                BusError::TransferFailed(code)
            })?;
        if received > data.len() {
            error!("upload of {}.0x{index:04x}.{sub} reports {received} bytes into a {} byte buffer",
                slave.name(), data.len());
            self.status.raise_fault();
            return Err(BusError::Protocol("upload length exceeds the destination buffer"));
        }
        Ok(received)
    }

    fn address(&self, slave: &Slave, index: u16, sub: u8) -> BusResult<TransferAddress> {
        let Some(id) = slave.slave_id(self.stack.as_ref()) else {
            error!("cannot resolve slave {} (station {})", slave.name(), slave.station_address());
            return Err(BusError::Binding("slave not found on the bus"));
        };
        Ok(TransferAddress {slave: id, index, sub})
    }
}
