/*!
    Attaching application variables to their bus entries.

    Binding happens once at startup, after the stack has been configured. Every failure here
    is a configuration mismatch between the application and the machine description, so
    binding errors are fatal and surfaced to the caller instead of triggering the runtime
    fault machinery.
*/

use crate::{
    error::{BusError, BusResult},
    slave::Slave,
    stack::{Direction, FieldbusStack, TransferAddress},
    variable::{AccessMode, Binding, BusVariable},
};

use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

/// running totals of what has been bound, for the one-time startup report
#[derive(Copy, Clone, Debug, Default)]
pub struct LinkStatistics {
    pub process_count: u32,
    pub process_bytes: u32,
    pub mailbox_count: u32,
    pub mailbox_bytes: u32,
}

/// verifies and records the attachment of variables to bus entries
pub struct VariableBinder {
    stack: Arc<dyn FieldbusStack>,
    verbose: bool,
    statistics: Mutex<LinkStatistics>,
}

impl VariableBinder {
    pub fn new(stack: Arc<dyn FieldbusStack>, verbose: bool) -> Self {
        Self {
            stack,
            verbose,
            statistics: Mutex::new(LinkStatistics::default()),
        }
    }

    pub fn statistics(&self) -> LinkStatistics {
        *self.statistics.lock()
    }

    /**
        attach a cyclic variable to the process data entry `slave-name.name`

        the entry's declared bit size and electronic type code must agree with the
        variable's declaration, otherwise the variable stays unbound and the error is
        returned
    */
    pub fn bind_process_variable(&self, slave: &Slave, name: &str, variable: &Arc<BusVariable>) -> BusResult {
        let direction = match variable.mode() {
            AccessMode::Input => Direction::Input,
            AccessMode::Output => Direction::Output,
            AccessMode::Mailbox =>
                return Err(BusError::Binding("mailbox variable bound as process data")),
        };
        let full = slave.full_identifier(name);

        let info = self.stack.find_variable(direction, &full)
            .map_err(|code| {
                error!("cannot find process variable {full}: {code}");
                BusError::Binding("process variable not found in bus description")
            })?;
        if info.bit_size != variable.bit_size() {
            error!("size mismatch on {full}: bus declares {} bits, variable declares {} bits",
                info.bit_size, variable.bit_size());
            return Err(BusError::TypeMismatch);
        }
        if ! variable.type_id().matches(info.type_code) {
            error!("type mismatch on {full}: bus declares type code {}, variable is {:?}",
                info.type_code, variable.type_id());
            return Err(BusError::TypeMismatch);
        }

        variable.bind(Binding::Process {bit_offset: info.bit_offset})?;
        {
            let mut statistics = self.statistics.lock();
            statistics.process_count += 1;
            statistics.process_bytes += variable.byte_size() as u32;
        }
        if self.verbose {
            debug!("linked process variable {full} at bit {}", info.bit_offset);
        }
        Ok(())
    }

    /**
        attach a mailbox variable to object `index.sub` on the slave

        emergency variables record the station address only and allocate nothing; ordinary
        variables get a stack transfer object sized to their byte length. An unresolvable
        slave releases the transfer object again before reporting the error.
    */
    pub fn bind_mailbox_variable(&self, slave: &Slave, index: u16, sub: u8, variable: &Arc<BusVariable>) -> BusResult {
        if variable.mode() != AccessMode::Mailbox
            {return Err(BusError::Binding("process variable bound as mailbox object"))}
        if variable.bit_size() == 0
            {return Err(BusError::Binding("zero sized mailbox variable"))}

        if variable.is_emergency() {
            if variable.bit_size() != 64 {
                error!("emergency variable on {} declares {} bits instead of 64",
                    slave.name(), variable.bit_size());
                return Err(BusError::Binding("emergency variable must be 8 bytes"));
            }
            variable.bind(Binding::Emergency {station: slave.station_address()})?;
            if self.verbose {
                debug!("linked emergency object for station {}", slave.station_address());
            }
            return Ok(());
        }

        let handle = self.stack.create_mailbox_transfer(variable.byte_size())
            .map_err(|code| {
                error!("cannot create mailbox transfer for {}.0x{index:04x}.{sub}: {code}", slave.name());
                BusError::Binding("cannot allocate mailbox transfer")
            })?;
        let Some(id) = slave.slave_id(self.stack.as_ref()) else {
            if let Err(code) = self.stack.delete_mailbox_transfer(handle) {
                warn!("cannot release mailbox transfer after failed bind: {code}");
            }
            error!("cannot resolve slave {} (station {})", slave.name(), slave.station_address());
            return Err(BusError::Binding("slave not found on the bus"));
        };

        if let Err(error) = variable.bind(Binding::Mailbox {
            handle,
            address: TransferAddress {slave: id, index, sub},
        }) {
            if let Err(code) = self.stack.delete_mailbox_transfer(handle) {
                warn!("cannot release mailbox transfer after failed bind: {code}");
            }
            return Err(error);
        }
        {
            let mut statistics = self.statistics.lock();
            statistics.mailbox_count += 1;
            statistics.mailbox_bytes += variable.byte_size() as u32;
        }
        if self.verbose {
            debug!("linked mailbox object {}.0x{index:04x}.{sub}", slave.name());
        }
        Ok(())
    }
}
