/*!
    Assembly of the runtime: one [Runtime] owns the transport, the device registry and the shared cycle context, and exposes the bring-up, exchange, supervision and shutdown entry points.

    The intended control flow: [Runtime::setup] once, [Runtime::bring_up] once, then [Runtime::supervise] concurrently with one of the exchange loops until [Runtime::shutdown] stops everything. Shutdown may be called from any context at any point, typically from a termination-signal task; it is reentrant-safe and never waits for the loops to acknowledge.
*/

use crate::{
    bringup::BringUp,
    clock::PhaseLock,
    cycle::{self, CycleContext},
    error::{RuntimeError, RuntimeResult},
    registry::{AlState, DeviceControl, Registry, SyncRole},
    supervisor::Supervisor,
    transport::{ClockParams, Target, Transport},
    };
use core::time::Duration;
use std::sync::{Arc, Mutex};

use log::{info, warn};

/// pause between two passive-mode cycles
const PASSIVE_PACING: Duration = Duration::from_millis(20);

/**
    the runtime orchestrating one master transport.

    Shareable behind an [Arc]: all methods take `&self`, cross-context scalar state lives in the atomic [CycleContext] and the registry sits behind its own mutex, which is never held across a blocking transport call.
*/
pub struct Runtime {
    transport: Box<dyn Transport>,
    registry: Mutex<Registry>,
    context: Arc<CycleContext>,
}

impl Runtime {
    /// wrap a transport, the registry stays empty until [Self::setup]
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Mutex::new(Registry::default()),
            context: Arc::new(CycleContext::new()),
        }
    }

    /**
        bind the transport and discover the devices, filling the registry.

        Fatal on an unreachable endpoint or an empty segment: no cyclic loop shall start after such a failure.
    */
    pub fn setup(&self, endpoint: &str) -> RuntimeResult<usize> {
        self.transport.open(endpoint)?;
        let discovered = Registry::new(self.transport.configure()?);
        if discovered.is_empty()
            {return Err(RuntimeError::Master("no devices found on the segment"))}

        let count = discovered.len();
        info!("{} devices found and configured", count);
        info!("distributed clock capable: {}", self.transport.clock_capable());
        *self.registry.lock().unwrap() = discovered;
        Ok(count)
    }

    /// the exchange state shared with application code and the supervisor
    pub fn context(&self) -> &Arc<CycleContext>  {&self.context}

    /// the device and group tables
    pub fn registry(&self) -> &Mutex<Registry>  {&self.registry}

    /// drive every device to operational, see [crate::bringup]
    ///
    /// `sync` is applied to every clock-capable device
    pub async fn bring_up(&self, sync: ClockParams) -> RuntimeResult {
        BringUp {
            transport: self.transport.as_ref(),
            registry: &self.registry,
            context: &self.context,
        }.run(sync).await
    }

    /// audit device states and drive recovery until the run flag clears, see [crate::supervisor]
    pub async fn supervise(&self) -> RuntimeResult {
        self.supervisor().run().await
    }

    /// whether the supervisor would run a reconciliation pass right now
    pub fn supervision_pending(&self) -> bool {
        self.supervisor().triggered()
    }

    /// one supervisor reconciliation pass, normally driven by [Self::supervise]
    pub fn reconcile(&self) -> RuntimeResult {
        self.supervisor().reconcile()
    }

    fn supervisor(&self) -> Supervisor<'_> {
        Supervisor {
            transport: self.transport.as_ref(),
            registry: &self.registry,
            context: &self.context,
        }
    }

    /// non-realtime exchange loop on the caller's task, see [crate::cycle]
    pub async fn exchange_passive(&self, output: impl FnMut(u64)) {
        cycle::passive(self.transport.as_ref(), &self.context, PASSIVE_PACING, output).await
    }

    /**
        realtime exchange loop with the given cycle period, see [crate::cycle].

        Meant to run on a dedicated prioritized thread, use [cycle::spawn_realtime](crate::spawn_realtime) for the usual setup. The period is validated before the loop starts, whether or not any device is phase-locked.
    */
    pub async fn exchange_realtime(
            &self,
            period: Duration,
            output: impl FnMut(u64),
            ) -> RuntimeResult {
        let clock = PhaseLock::new(period)?;
        let phase_locked = self.registry.lock().unwrap()
            .devices()
            .any(|device| device.sync != SyncRole::Free);
        cycle::realtime(self.transport.as_ref(), &self.context, clock, phase_locked, output).await
    }

    /**
        stop the run, return every device to the init state and release the transport.

        Reentrant-safe and callable concurrently with the loops: flags are atomic, disabling an already-disabled sync impulse and closing an already-closed transport are no-ops. The loops observe the cleared run flag at their next suspension point, this method does not wait for them.
    */
    pub fn shutdown(&self) {
        info!("shutting down, requesting init state for all devices");
        self.context.set_running(false);
        self.context.set_operational(false);

        let enabled: Vec<u16> = self.registry.lock().unwrap()
            .devices()
            .filter(|device| device.sync != SyncRole::Free)
            .map(|device| device.index)
            .collect();
        for &index in &enabled {
            if let Err(err) = self.transport.set_clock_sync(index, None) {
                warn!("cannot disable clock sync on device {}: {}", index, err);
            }
        }
        {
            let mut registry = self.registry.lock().unwrap();
            for index in enabled {
                if let Some(device) = registry.device_mut(index)
                    {device.sync = SyncRole::Free}
            }
        }

        if let Err(err) = self.transport.request_state(
                Target::Group, DeviceControl::request(AlState::Init)) {
            warn!("cannot request init state: {}", err);
        }
        self.transport.close();
    }
}
