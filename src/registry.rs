/*!
    In-memory table of device and group records.

    The registry is pure data: it is filled once from the transport's discovery results and then mutated by the bring-up coordinator (state transitions) and the supervisor (recovery flags). Devices are never removed during a run, their count and indices are fixed after configuration.

    The registry itself carries no synchronization, the [Runtime](crate::runtime::Runtime) owning it wraps it in a mutex and its users must release that mutex before any blocking transport call.
*/

use crate::transport::{ClockParams, Configured};
use core::fmt;
use core::time::Duration;

/**
    the current application-layer state of one device.

    Except [Self::Bootstrap], changing to any state can be requested from any upper state or from the preceding one.

    ETG.1000.6 table 9
*/
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
#[repr(u8)]
pub enum AlState {
    /// the device does not answer at all, usually meaning it dropped off the segment
    #[default]
    None = 0x00,
    /// initialization state, only register communication is possible
    Init = 0x01,
    /// mailbox communication is possible, no process data yet
    PreOperational = 0x02,
    /// transitional state for firmware download, cannot be requested by this runtime
    Bootstrap = 0x03,
    /// process data inputs are valid, outputs are still ignored by the device
    SafeOperational = 0x04,
    /// full realtime operation, the device executes the outputs the master sends
    Operational = 0x08,
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Init => "init",
            Self::PreOperational => "pre-op",
            Self::Bootstrap => "boot",
            Self::SafeOperational => "safe-op",
            Self::Operational => "op",
        })
    }
}

/**
    a state-change request sent to one device or to the whole group.

    The acknowledge flag mirrors the protocol's error-acknowledge bit: requesting [AlState::SafeOperational] with it set clears a `safe-operational + error` condition.
*/
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceControl {
    pub state: AlState,
    pub acknowledge: bool,
}
impl DeviceControl {
    /// plain state request
    pub fn request(state: AlState) -> Self {
        Self {state, acknowledge: false}
    }
    /// state request also acknowledging a pending device error
    pub fn acknowledge(state: AlState) -> Self {
        Self {state, acknowledge: true}
    }
}

/// the observed status of one device, as refreshed from the transport
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct DeviceStatus {
    pub state: AlState,
    /// the device flags an application-layer error on top of its state
    pub error: bool,
    /// last AL status code reported, `0` when no error
    pub code: u16,
}

/**
    clock synchronization role of one device, resolved once at configuration time.

    This tag replaces any name-based dispatch in the cyclic path: the hot loops only ever check the variant.
*/
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub enum SyncRole {
    /// free-running, the device is not phase-locked
    #[default]
    Free,
    /// sync impulse 0 enabled with the given cyclic period
    Sync0 {period: Duration},
    /// sync impulses 0 and 1 enabled, the secondary period shifts impulse 1 relative to impulse 0
    Sync01 {period: Duration, secondary: Duration},
}
impl SyncRole {
    /// transport parameters enabling this role, or `None` for a free-running device
    pub fn params(&self) -> Option<ClockParams> {
        match *self {
            Self::Free => None,
            Self::Sync0 {period} => Some(ClockParams {
                period,
                secondary: Duration::ZERO,
                shift: 0,
                }),
            Self::Sync01 {period, secondary} => Some(ClockParams {
                period,
                secondary,
                shift: 0,
                }),
        }
    }
}

/// one device as known to the runtime, indices are 1-based and stable for the process lifetime
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub index: u16,
    pub name: String,
    pub state: AlState,
    pub error: bool,
    pub status_code: u16,
    /// the device advertises distributed-clock capability
    pub clock_capable: bool,
    /// role actually enabled on the device, [SyncRole::Free] until bring-up enables it
    pub sync: SyncRole,
    /// set by the supervisor when the device stopped answering, cleared on recovery
    pub lost: bool,
    pub output_bytes: u32,
    pub output_bits: u32,
    pub input_bytes: u32,
    pub input_bits: u32,
    pub group: u8,
}
impl DeviceRecord {
    /// output segment size in bytes, devices mapping less than one byte still count for one
    pub fn output_span(&self) -> u32 {
        if self.output_bytes == 0 && self.output_bits > 0 {1} else {self.output_bytes}
    }
    /// input segment size in bytes, same rounding as [Self::output_span]
    pub fn input_span(&self) -> u32 {
        if self.input_bytes == 0 && self.input_bits > 0 {1} else {self.input_bytes}
    }
    /// merge a refreshed status into the record
    pub fn apply(&mut self, status: DeviceStatus) {
        self.state = status.state;
        self.error = status.error;
        self.status_code = status.code;
    }
}

/// one synchronized process-data exchange unit, aggregating the expected response accounting of its devices
#[derive(Debug, Clone, Default)]
pub struct GroupRecord {
    /// devices expected to answer the output part of an exchange
    pub expected_outputs: u16,
    /// devices expected to answer the input part of an exchange
    pub expected_inputs: u16,
    /// the supervisor must run another full reconciliation pass
    pub recheck: bool,
    /// logical-memory segmentation of the group image, byte counts per segment
    pub segments: Vec<u32>,
}
impl GroupRecord {
    /**
        expected response count of one full exchange.

        Outputs are counted twice because the protocol's response accounting covers both the output write and the subsequent input read within one frame.
    */
    pub fn expected_responses(&self) -> u16 {
        2 * self.expected_outputs + self.expected_inputs
    }
}

/// the device and group tables, see the module documentation
#[derive(Debug, Default)]
pub struct Registry {
    devices: Vec<DeviceRecord>,
    groups: Vec<GroupRecord>,
}
impl Registry {
    /// build the registry from the transport's discovery results
    pub fn new(configured: Configured) -> Self {
        Self {
            devices: configured.devices.into_iter()
                .enumerate()
                .map(|(i, device)| DeviceRecord {
                    index: (i + 1) as u16,
                    name: device.name,
                    state: AlState::None,
                    error: false,
                    status_code: 0,
                    clock_capable: device.clock_capable,
                    sync: SyncRole::Free,
                    lost: false,
                    output_bytes: device.output_bytes,
                    output_bits: device.output_bits,
                    input_bytes: device.input_bytes,
                    input_bits: device.input_bits,
                    group: device.group,
                })
                .collect(),
            groups: configured.groups.into_iter()
                .map(|group| GroupRecord {
                    expected_outputs: group.expected_outputs,
                    expected_inputs: group.expected_inputs,
                    recheck: false,
                    segments: group.segments,
                })
                .collect(),
        }
    }

    /// number of devices discovered
    pub fn len(&self) -> usize  {self.devices.len()}
    pub fn is_empty(&self) -> bool  {self.devices.is_empty()}

    /// device record by 1-based index
    pub fn device(&self, index: u16) -> Option<&DeviceRecord> {
        self.devices.get(usize::from(index).checked_sub(1)?)
    }
    pub fn device_mut(&mut self, index: u16) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(usize::from(index).checked_sub(1)?)
    }
    pub fn devices(&self) -> impl Iterator<Item=&DeviceRecord> {
        self.devices.iter()
    }

    pub fn group(&self, index: u8) -> Option<&GroupRecord> {
        self.groups.get(usize::from(index))
    }
    pub fn group_mut(&mut self, index: u8) -> Option<&mut GroupRecord> {
        self.groups.get_mut(usize::from(index))
    }

    /// merge refreshed statuses, indexed in discovery order like the device table
    pub fn merge_states(&mut self, states: &[DeviceStatus]) {
        for (record, status) in self.devices.iter_mut().zip(states) {
            record.apply(*status);
        }
    }
}
