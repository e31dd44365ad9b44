/*!
    Bring-up coordinator: drives every discovered device from its current state to operational, or fails with a diagnosable cause.

    Every failure path here is terminal for the attempt, there is no silent retry-forever: the caller decides whether to start a new sequence. Once a device is operational, nothing in this crate pulls it backward except [Runtime::shutdown](crate::runtime::Runtime::shutdown); only external device faults do, and those are the supervisor's business.
*/

use crate::{
    cycle::CycleContext,
    error::{RuntimeError, RuntimeResult},
    registry::{AlState, DeviceControl, Registry, SyncRole},
    transport::{timeout, ClockParams, Target, Transport},
    };
use core::time::Duration;
use std::sync::Mutex;

use futures_concurrency::future::Join;
use log::{debug, error, info, warn};

/// polls of the operational wait loop before giving up
const OPERATIONAL_ATTEMPTS: u32 = 40;
/// state check duration of one poll
const OPERATIONAL_CHECK: Duration = Duration::from_millis(50);
/// pause between two polls
const OPERATIONAL_PAUSE: Duration = Duration::from_millis(10);

pub(crate) struct BringUp<'a> {
    pub transport: &'a dyn Transport,
    pub registry: &'a Mutex<Registry>,
    pub context: &'a CycleContext,
}

impl BringUp<'_> {
    /// the whole bring-up sequence, from safe-operational wait to the in-operation mark
    pub async fn run(&self, sync: ClockParams) -> RuntimeResult {
        // all devices must already be heading to safe-operational after configuration
        let reached = self.transport.wait_state(
            Target::Group, AlState::SafeOperational, 4 * timeout::STATE);
        if reached != AlState::SafeOperational {
            error!("not all devices reached safe-operational (group state: {})", reached);
            self.report_offenders(AlState::SafeOperational)?;
            return Err(RuntimeError::Timeout("devices failed to reach safe-operational"));
        }
        info!("all devices reached safe-operational");

        self.enable_clock_sync(sync).await;

        // snapshot for diagnostics, and the group's response accounting
        let states = self.transport.read_states()?;
        let expected = {
            let mut registry = self.registry.lock().unwrap();
            registry.merge_states(&states);
            for device in registry.devices() {
                info!("device {} name {:?} outputs {:3}bits inputs {:3}bits state {}",
                    device.index, device.name,
                    device.output_bits, device.input_bits, device.state);
            }
            let group = registry.group(0)
                .ok_or(RuntimeError::Master("no group configured"))?;
            info!("segments: {:?}", group.segments);
            info!("expected response count ({} x 2) + {} = {}",
                group.expected_outputs, group.expected_inputs, group.expected_responses());
            group.expected_responses()
        };
        self.context.set_expected(expected);

        // one priming exchange so the devices see valid outputs the instant they switch;
        // best effort, the result is reported but not checked
        self.transport.send_exchange();
        let primed = self.transport.receive_exchange(timeout::RETURN);
        debug!("priming exchange answered by {} devices", primed.responses);

        info!("requesting operational state for all devices");
        self.transport.request_state(
            Target::Group, DeviceControl::request(AlState::Operational))?;
        let mut reached = self.transport.wait_state(
            Target::Group, AlState::Operational, 2 * timeout::STATE);

        // keep exchanging process data while polling, devices may require live outputs to switch
        let mut attempts = OPERATIONAL_ATTEMPTS;
        while reached != AlState::Operational && attempts > 0 {
            self.transport.send_exchange();
            self.transport.receive_exchange(timeout::RETURN);
            reached = self.transport.wait_state(
                Target::Group, AlState::Operational, OPERATIONAL_CHECK);
            tokio::time::sleep(OPERATIONAL_PAUSE).await;
            attempts -= 1;
        }
        if reached != AlState::Operational {
            error!("not all devices reached operational (group state: {})", reached);
            self.report_offenders(AlState::Operational)?;
            return Err(RuntimeError::Timeout("devices failed to reach operational"));
        }

        info!("operational state reached for all devices");
        self.context.set_running(true);
        self.context.set_operational(true);
        Ok(())
    }

    /// enable the sync impulses on every clock-capable device, in no particular order
    ///
    /// failing to enable one device is not fatal to the bring-up, it will simply free-run
    async fn enable_clock_sync(&self, sync: ClockParams) {
        let capable: Vec<u16> = self.registry.lock().unwrap()
            .devices()
            .filter(|device| device.clock_capable)
            .map(|device| device.index)
            .collect();

        let enabled = capable.iter()
            .map(|&index| async move {
                (index, self.transport.set_clock_sync(index, Some(sync)))
            })
            .collect::<Vec<_>>()
            .join().await;

        let mut registry = self.registry.lock().unwrap();
        for (index, result) in enabled {
            match result {
                Ok(()) => {
                    info!("clock sync enabled on device {}", index);
                    if let Some(device) = registry.device_mut(index) {
                        device.sync = if sync.secondary.is_zero()
                            {SyncRole::Sync0 {period: sync.period}}
                        else
                            {SyncRole::Sync01 {period: sync.period, secondary: sync.secondary}};
                    }
                }
                Err(err) => warn!("cannot enable clock sync on device {}: {}", index, err),
            }
        }
    }

    /// refresh and log the state and status of every device not in the expected state
    fn report_offenders(&self, expected: AlState) -> RuntimeResult {
        let states = self.transport.read_states()?;
        let offenders: Vec<_> = {
            let mut registry = self.registry.lock().unwrap();
            registry.merge_states(&states);
            registry.devices()
                .filter(|device| device.state != expected)
                .map(|device| (device.index, device.state, device.status_code))
                .collect()
        };
        for (index, state, code) in offenders {
            error!("device {} state={} status=0x{:04x}: {}",
                index, state, code, self.transport.describe_status(code));
        }
        Ok(())
    }
}
