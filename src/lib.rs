mod error;
mod registry;
mod transport;
mod clock;
mod cycle;
mod bringup;
mod supervisor;
mod runtime;

pub use crate::error::{RuntimeError, RuntimeResult};
pub use crate::registry::*;
pub use crate::transport::*;
pub use crate::clock::PhaseLock;
pub use crate::cycle::{CycleContext, spawn_realtime};
pub use crate::runtime::Runtime;
