/*!
    Realtime coordination core binding typed application variables to a cyclic fieldbus
    master stack.

    The vendor stack moves the frames, this crate owns everything around it: the realtime
    timing and job threads running the bus cycle, typed process data and mailbox variables
    with bounded-wait access, notification routing with per-error-class rate limiting, the
    sticky master fault, and automatic bus recovery when slaves drop out.

    Entry point is [Master], fed with a [stack::FieldbusStack] implementation and a
    [stack::LinkLayer] descriptor.
*/

pub mod binding;
pub mod config;
pub mod data;
pub mod error;
pub mod master;
pub mod notify;
pub mod ratelimit;
pub mod recovery;
pub mod sdo;
pub mod slave;
pub mod stack;
pub mod status;
pub mod sync;
pub mod variable;

pub use crate::config::{FaultPolicy, MasterConfig};
pub use crate::data::{BusData, TypeId};
pub use crate::error::{BusError, BusResult};
pub use crate::master::Master;
pub use crate::slave::{Slave, SlaveDevice};
pub use crate::stack::{BusState, DescriptionSource, FieldbusStack, LinkLayer};
pub use crate::variable::{BusVar, TransferState};
