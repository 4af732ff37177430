//! definition of the general error type of the coordination layer

use crate::stack::StackError;

use thiserror::Error;

/**
    unexpected result regarding the coordination of the bus

    Its variants are meant to help finding the cause responsible for the problem and how to
    deal with it. Configuration-time errors ([Self::Binding], [Self::TypeMismatch]) are fatal
    and shall abort startup, runtime errors are reported to the caller and may additionally
    have raised the sticky master fault.
*/
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BusError {
    /// a variable could not be attached to its bus entry
    #[error("binding failed: {0}")]
    Binding(&'static str),

    /// the variable's declared type or size disagrees with the bus description
    #[error("variable type does not match the configured bus entry")]
    TypeMismatch,

    /// an asynchronous mailbox transfer is still running on this variable
    #[error("a mailbox transfer is already in progress on this variable")]
    TransferInProgress,

    /// a mailbox transfer was issued but failed
    #[error("mailbox transfer failed: {0}")]
    TransferFailed(StackError),

    /// the underlying stack rejected an operation
    #[error("stack call failed: {0}")]
    Stack(StackError),

    /// the master is being misused by the caller
    #[error("master misuse: {0}")]
    Master(&'static str),

    /// the stack broke its own contract
    #[error("protocol contract violated: {0}")]
    Protocol(&'static str),

    /// a bounded wait elapsed
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

impl From<StackError> for BusError {
    fn from(src: StackError) -> Self {
        Self::Stack(src)
    }
}

pub type BusResult<T = ()> = Result<T, BusError>;
