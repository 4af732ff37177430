//! Slave identity and the device-logic seam.

use crate::stack::{FieldbusStack, SlaveId};

use std::sync::OnceLock;

use parking_lot::Mutex;

/**
    hooks for device-specific logic attached to a slave

    Called from [crate::master::Master::process] on a non-realtime thread, so an
    implementation is free to run mailbox transfers or block briefly.
*/
pub trait SlaveDevice: Send {
    /// called once each time the bus enters OP
    fn enter_operational(&mut self);
    /// called every [crate::master::Master::process] while the bus is SAFEOP or OP
    fn process(&mut self);
}

/**
    one slave declared by the application

    Carries the symbolic name used to compose full variable identifiers, the station
    address, and the stack-internal slave id resolved lazily on first use since the stack
    only knows its slaves after configuration.
*/
pub struct Slave {
    name: String,
    station: u16,
    id: OnceLock<SlaveId>,
    device: Option<Mutex<Box<dyn SlaveDevice>>>,
}

impl Slave {
    pub fn new<S: Into<String>>(name: S, station: u16) -> Self {
        Self {
            name: name.into(),
            station,
            id: OnceLock::new(),
            device: None,
        }
    }

    /// same as [Self::new] with device hooks attached
    pub fn with_device<S: Into<String>>(name: S, station: u16, device: Box<dyn SlaveDevice>) -> Self {
        Self {
            name: name.into(),
            station,
            id: OnceLock::new(),
            device: Some(Mutex::new(device)),
        }
    }

    pub fn name(&self) -> &str {&self.name}
    pub fn station_address(&self) -> u16 {self.station}

    /// full identifier of one of this slave's process variables in the bus description
    pub fn full_identifier(&self, variable: &str) -> String {
        format!("{}.{}", self.name, variable)
    }

    /**
        stack-internal id of this slave, resolved on first call and cached

        `None` as long as the stack cannot find the station, resolution is retried on the
        next call
    */
    pub fn slave_id(&self, stack: &dyn FieldbusStack) -> Option<SlaveId> {
        if let Some(id) = self.id.get()
            {return Some(*id)}
        let id = stack.resolve_slave(self.station)?;
        Some(*self.id.get_or_init(|| id))
    }

    pub(crate) fn enter_operational(&self) {
        if let Some(device) = &self.device {
            device.lock().enter_operational();
        }
    }

    pub(crate) fn process(&self) {
        if let Some(device) = &self.device {
            device.lock().process();
        }
    }
}
