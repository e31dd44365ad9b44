//! definition of the general runtime error type

use std::sync::Arc;
use core::fmt;

/**
    general object reporting an unexpected result of a runtime operation

    Its variants are meant to help finding the cause responsible for the problem and how to deal with it.

    [Self::Device] variant should not be used without an appropriate type for `T`, `T` depends on the operation the device reports for, and is usually a status code, or an enum.
*/
#[derive(Clone, Debug)]
pub enum RuntimeError<T=()> {
    /// error caused by the communication medium
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a device, its type depends on the operation returning this error
    ///
    /// these errors can generally be handled and fixed by retrying the operation or reconfiguring the device
    Device(T),

    /// error reported by the master side
    ///
    /// these errors can generally be handled by retrying the operation or using the runtime differently when the issue is in the user code
    Master(&'static str),

    /// error due to too much time elapsed, but which does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried
    Timeout(&'static str),

    /// error in the values configured by the user, detected before any device is touched
    ///
    /// these errors must be fixed in the configuration, retrying cannot help
    Config(&'static str),
}

/// convenient alias to simplify return annotations
pub type RuntimeResult<T=(), E=()> = core::result::Result<T, RuntimeError<E>>;

impl<T: fmt::Debug> fmt::Display for RuntimeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(value)      => write!(f, "io: {}", value),
            Self::Device(value)  => write!(f, "device: {:?}", value),
            Self::Master(value)  => write!(f, "master: {}", value),
            Self::Timeout(value) => write!(f, "timeout: {}", value),
            Self::Config(value)  => write!(f, "config: {}", value),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for RuntimeError<T> {}

impl<T> From<std::io::Error> for RuntimeError<T> {
    fn from(src: std::io::Error) -> Self {
        RuntimeError::Io(Arc::new(src))
    }
}
