/*!
    This module provides the trait [Transport], the abstract master stack this runtime orchestrates.

    The transport is responsible for framing, addressing, discovery and physical I/O. The runtime only requires the operations below and treats each of them as a bounded-blocking call: every waiting operation carries a caller-supplied timeout and none of them may block indefinitely. Calls are short enough to be issued inline from the async orchestration, the same way the underlying socket sends are.
*/

use crate::{
    error::RuntimeResult,
    registry::{AlState, DeviceControl, DeviceStatus},
    };
use core::time::Duration;

/// protocol timeout units, the bring-up and supervision logic scales them as needed
pub mod timeout {
    use core::time::Duration;

    /// one state-change wait unit
    pub const STATE: Duration = Duration::from_secs(2);
    /// bounded wait for one process-data response
    pub const RETURN: Duration = Duration::from_millis(2);
    /// bounded wait for a single-device reconfiguration or recovery
    pub const RECOVERY: Duration = Duration::from_millis(500);
}

/// destination of a state request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Target {
    /// all devices of the (single) group
    Group,
    /// one device, addressed by its 1-based registry index
    Device(u16),
}

/// per-device clock synchronization parameters
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ClockParams {
    /// cyclic period of the primary sync impulse
    pub period: Duration,
    /// period of the secondary impulse, zero makes it fire together with the primary
    pub secondary: Duration,
    /// phase shift of the impulses relative to the period edge, in nanoseconds
    pub shift: i32,
}

/// result of one process-data exchange
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Exchange {
    /// observed response count (work counter) of the exchange
    pub responses: u16,
    /// reference-clock timestamp captured with the response, in nanoseconds
    pub reference_time: i64,
}

/// one discovered device, as reported by [Transport::configure]
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    pub name: String,
    pub clock_capable: bool,
    pub output_bytes: u32,
    pub output_bits: u32,
    pub input_bytes: u32,
    pub input_bits: u32,
    pub group: u8,
}

/// response accounting and layout of one discovered group
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub expected_outputs: u16,
    pub expected_inputs: u16,
    pub segments: Vec<u32>,
}

/// everything [Transport::configure] discovered
#[derive(Debug, Clone, Default)]
pub struct Configured {
    pub devices: Vec<DeviceConfig>,
    pub groups: Vec<GroupConfig>,
}

/**
    trait abstracting the master stack below the runtime.

    Implementors own the device table of the wire protocol and the process-data image, the runtime never touches frames. All methods take `&self`: an implementor serving the cyclic loop and the supervisor concurrently must be internally synchronized.
*/
pub trait Transport: Send + Sync {
    /// bind to a transport endpoint (a NIC name for raw-ethernet stacks)
    fn open(&self, endpoint: &str) -> RuntimeResult;

    /// release the endpoint, must be idempotent
    fn close(&self);

    /// discover and auto-configure the devices of the segment, mapping their process data
    ///
    /// returns the discovered devices and groups, an empty device list means no device answered
    fn configure(&self) -> RuntimeResult<Configured>;

    /// whether distributed-clock capability is available across the discovered devices
    fn clock_capable(&self) -> bool;

    /// send a state-change request, without waiting for the transition
    fn request_state(&self, target: Target, control: DeviceControl) -> RuntimeResult;

    /// poll the target until it reaches the given state or the timeout elapses, returning the state actually observed last
    fn wait_state(&self, target: Target, state: AlState, timeout: Duration) -> AlState;

    /// read the current state and status code of every device, in discovery order
    fn read_states(&self) -> RuntimeResult<Vec<DeviceStatus>>;

    /// enable (`Some`) or disable (`None`) clock synchronization impulses on one device
    fn set_clock_sync(&self, index: u16, params: Option<ClockParams>) -> RuntimeResult;

    /// send one process-data frame, never blocks
    fn send_exchange(&self);

    /// receive the response to the last sent frame, waiting at most `timeout`
    ///
    /// a response count of zero with no error means the frame was lost, the next cycle retries
    fn receive_exchange(&self, timeout: Duration) -> Exchange;

    /// attempt a bounded reconfiguration of a single device, returning the state it ends in
    fn reconfigure(&self, index: u16, timeout: Duration) -> RuntimeResult<AlState>;

    /// attempt to re-admit a device that dropped off the segment
    fn recover(&self, index: u16, timeout: Duration) -> RuntimeResult;

    /// translate an AL status code into a human-readable description, for diagnostics only
    fn describe_status(&self, code: u16) -> &'static str;
}
