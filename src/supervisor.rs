/*!
    Fault detection and recovery of devices that drop out of the operational state.

    The supervisor is a level-triggered reconciliation loop, not an edge-triggered one: it re-validates the whole group every poll interval while the system is in operation, tolerates stale reads of the shared cycle context, and is safe to run redundantly. Every device fault it handles stays local, none of its actions terminates the run.
*/

use crate::{
    cycle::CycleContext,
    error::RuntimeResult,
    registry::{AlState, DeviceControl, Registry},
    transport::{timeout, Target, Transport},
    };
use core::time::Duration;
use std::sync::Mutex;

use log::{debug, error, info, warn};

/// poll interval of the audit loop
const POLL: Duration = Duration::from_millis(10);

pub(crate) struct Supervisor<'a> {
    pub transport: &'a dyn Transport,
    pub registry: &'a Mutex<Registry>,
    pub context: &'a CycleContext,
}

impl Supervisor<'_> {
    /// audit loop, runs until the run flag is cleared
    pub async fn run(&self) -> RuntimeResult {
        use futures::stream::StreamExt;
        let mut interval = tokio_timerfd::Interval::new_interval(POLL)?;

        while self.context.running() {
            match interval.next().await {
                Some(tick) => {tick?;}
                None => break,
            }
            if ! self.triggered()  {continue}
            // a failing refresh is a steady-state fault: report and retry next poll
            if let Err(err) = self.reconcile() {
                error!("device audit failed: {}", err);
            }
        }
        Ok(())
    }

    /// whether a reconciliation pass is due: in operation, and a response shortfall or a pending recheck
    pub fn triggered(&self) -> bool {
        if ! self.context.operational()  {return false}
        self.context.shortfall()
            || self.registry.lock().unwrap().group(0).map_or(false, |group| group.recheck)
    }

    /**
        one full reconciliation pass over the group.

        The pass refreshes every device state, then drives each non-operational device one step toward recovery. The registry mutex is never held across a transport call: the pass works on a snapshot and applies its flag updates at the end.
    */
    pub fn reconcile(&self) -> RuntimeResult {
        let states = self.transport.read_states()?;
        let snapshot: Vec<(u16, AlState, bool, bool)> = {
            let mut registry = self.registry.lock().unwrap();
            if let Some(group) = registry.group_mut(0)  {group.recheck = false}
            registry.merge_states(&states);
            registry.devices()
                .map(|device| (device.index, device.state, device.error, device.lost))
                .collect()
        };

        let mut recheck = false;
        let mut updates = Vec::with_capacity(snapshot.len());

        for (index, mut state, error, mut lost) in snapshot {
            if state != AlState::Operational {
                recheck = true;

                if state == AlState::SafeOperational && error {
                    error!("device {} is in safe-operational + error, acknowledging", index);
                    if let Err(err) = self.transport.request_state(
                            Target::Device(index),
                            DeviceControl::acknowledge(AlState::SafeOperational),
                            ) {
                        warn!("device {} acknowledge request failed: {}", index, err);
                    }
                }
                else if state == AlState::SafeOperational {
                    warn!("device {} is in safe-operational, requesting operational", index);
                    if let Err(err) = self.transport.request_state(
                            Target::Device(index),
                            DeviceControl::request(AlState::Operational),
                            ) {
                        warn!("device {} operational request failed: {}", index, err);
                    }
                }
                else if state != AlState::None {
                    match self.transport.reconfigure(index, timeout::RECOVERY) {
                        Ok(reached) => {
                            lost = false;
                            state = reached;
                            info!("device {} reconfigured", index);
                        }
                        Err(err) => debug!("device {} reconfiguration failed: {}", index, err),
                    }
                }
                else if ! lost {
                    // re-poll once before declaring the device lost
                    state = self.transport.wait_state(
                        Target::Device(index), AlState::Operational, timeout::RETURN);
                    if state == AlState::None {
                        lost = true;
                        error!("device {} lost", index);
                    }
                }
            }
            else {
                // operational devices also force another pass, the whole group is re-validated
                recheck = true;
            }

            if lost {
                if state == AlState::None {
                    match self.transport.recover(index, timeout::RECOVERY) {
                        Ok(()) => {
                            lost = false;
                            info!("device {} recovered", index);
                        }
                        Err(err) => debug!("device {} recovery failed: {}", index, err),
                    }
                }
                else {
                    // the device reappeared on its own
                    lost = false;
                    info!("device {} found", index);
                }
            }
            updates.push((index, state, lost));
        }

        {
            let mut registry = self.registry.lock().unwrap();
            for (index, state, lost) in updates {
                if let Some(device) = registry.device_mut(index) {
                    device.state = state;
                    device.lost = lost;
                }
            }
            if let Some(group) = registry.group_mut(0)  {group.recheck = recheck}
        }
        if ! recheck {
            info!("all devices resumed operational");
        }
        Ok(())
    }
}
