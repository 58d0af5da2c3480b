//! definition of the general fieldbus error type

use std::sync::Arc;
use thiserror::Error;

/**
    general error reporting an unexpected result in fieldbus communication

    The variants tell where the problem originates and what can be done about
    it. [Self::Slave] should not be used without an appropriate type for `T`:
    it depends on the operation the slave reports for, and is usually an abort
    code or a status enum.
*/
#[derive(Clone, Debug, Error)]
pub enum FieldbusError<T=()> {
    /// error caused by the communication support, exterior to this crate
    #[error("transport: {0}")]
    Io(Arc<std::io::Error>),

    /// no echoed frame came back within the exchange deadline
    ///
    /// the affected slaves are degraded but the cyclic loop continues
    #[error("no echoed frame within the exchange deadline")]
    FrameTimeout,

    /// no mailbox response within the transaction budget, the transaction slot is freed
    #[error("no mailbox response within the transaction budget")]
    MailboxTimeout,

    /// a mailbox transaction is already pending on this slave, the request was not sent
    #[error("a mailbox transaction is already pending on slave {0}")]
    MailboxBusy(u16),

    /// the slave acknowledged a different lifecycle state than requested
    #[error("slave {slave} reached state 0x{reported:02x} instead of 0x{requested:02x}")]
    StateTransitionRejected {slave: u16, requested: u8, reported: u8},

    /// a payload whose size does not match its command, rejected at construction
    ///
    /// this is a caller bug and must fail fast rather than be masked
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),

    /// error code reported by a slave, its type depends on the operation returning this error
    #[error("slave reported: {0:?}")]
    Slave(T),

    /// misuse of the master, can generally be fixed in the calling code
    #[error("master: {0}")]
    Master(&'static str),

    /// violation of the wire protocol detected by the master
    ///
    /// these errors can generally not be fixed and the communication has to be restarted
    #[error("protocol: {0}")]
    Protocol(&'static str),
}

/// convenient alias to simplify return annotations
pub type FieldbusResult<T=(), E=()> = core::result::Result<T, FieldbusError<E>>;

impl<T> From<std::io::Error> for FieldbusError<T> {
    fn from(src: std::io::Error) -> Self {
        FieldbusError::Io(Arc::new(src))
    }
}

impl<T> From<crate::data::PackingError> for FieldbusError<T> {
    fn from(src: crate::data::PackingError) -> Self {
        match src {
            crate::data::PackingError::BadSize(_, text) => FieldbusError::MalformedPayload(text),
            crate::data::PackingError::InvalidValue(text) => FieldbusError::Protocol(text),
        }
    }
}

// rust implements `From<T> for T` so generic conversions between slave error
// types cannot go through `From`, these are manual conversion methods instead
impl<E> FieldbusError<E> {
    /// convert the error with a callback handling the slave-specific error case
    pub fn map<F, T>(self, callback: F) -> FieldbusError<T>
    where F: FnOnce(E) -> T
    {
        match self {
            FieldbusError::Slave(value) => FieldbusError::Slave(callback(value)),
            FieldbusError::Io(e) => FieldbusError::Io(e),
            FieldbusError::FrameTimeout => FieldbusError::FrameTimeout,
            FieldbusError::MailboxTimeout => FieldbusError::MailboxTimeout,
            FieldbusError::MailboxBusy(slave) => FieldbusError::MailboxBusy(slave),
            FieldbusError::StateTransitionRejected {slave, requested, reported}
                => FieldbusError::StateTransitionRejected {slave, requested, reported},
            FieldbusError::MalformedPayload(message) => FieldbusError::MalformedPayload(message),
            FieldbusError::Master(message) => FieldbusError::Master(message),
            FieldbusError::Protocol(message) => FieldbusError::Protocol(message),
        }
    }
}
impl FieldbusError<()> {
    /// convert an error with no slave-specific type into an error with one
    pub fn upgrade<F>(self) -> FieldbusError<F> {
        self.map(|()| unreachable!("an error with no slave-specific type cannot hold a slave error"))
    }
}
