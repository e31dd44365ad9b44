/*!
    Run the whole runtime over a simulated segment: bring-up, supervision and one of the exchange loops, until ctrl-c.

    Usage: `op_run <endpoint> [cycle-ms]`

    Passing a cycle period in milliseconds selects the realtime exchange mode on a dedicated prioritized thread, otherwise the passive loop runs on the async runtime.
*/

use etherop::{
    spawn_realtime, AlState, ClockParams, Configured, DeviceConfig, DeviceControl,
    DeviceStatus, Exchange, GroupConfig, Runtime, RuntimeError, RuntimeResult,
    Target, Transport,
    };
use std::{
    env,
    process::exit,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
    };
use log::{debug, error};

/// three obedient devices: every state request succeeds, every exchange is fully answered
struct Simulated {
    states: Mutex<Vec<AlState>>,
    start: Instant,
}
impl Simulated {
    fn new() -> Self {
        Self {
            states: Mutex::new(vec![AlState::SafeOperational; 3]),
            start: Instant::now(),
        }
    }
}
impl Transport for Simulated {
    fn open(&self, endpoint: &str) -> RuntimeResult {
        if endpoint.is_empty()
            {return Err(RuntimeError::Config("empty endpoint"))}
        Ok(())
    }
    fn close(&self) {}
    fn configure(&self) -> RuntimeResult<Configured> {
        Ok(Configured {
            devices: vec![
                DeviceConfig {
                    name: "coupler".into(),
                    input_bytes: 2, input_bits: 16,
                    .. Default::default()},
                DeviceConfig {
                    name: "drive".into(),
                    clock_capable: true,
                    output_bytes: 8, output_bits: 64,
                    input_bytes: 8, input_bits: 64,
                    .. Default::default()},
                DeviceConfig {
                    name: "io block".into(),
                    output_bits: 4, input_bits: 4,
                    .. Default::default()},
            ],
            groups: vec![GroupConfig {
                expected_outputs: 2,
                expected_inputs: 1,
                segments: vec![10, 3],
            }],
        })
    }
    fn clock_capable(&self) -> bool  {true}
    fn request_state(&self, target: Target, control: DeviceControl) -> RuntimeResult {
        let mut states = self.states.lock().unwrap();
        match target {
            Target::Group => states.fill(control.state),
            Target::Device(index) => states[usize::from(index) - 1] = control.state,
        }
        Ok(())
    }
    fn wait_state(&self, target: Target, state: AlState, _timeout: Duration) -> AlState {
        let states = self.states.lock().unwrap();
        match target {
            Target::Group =>
                if states.iter().all(|current| *current == state) {state} else {states[0]},
            Target::Device(index) => states[usize::from(index) - 1],
        }
    }
    fn read_states(&self) -> RuntimeResult<Vec<DeviceStatus>> {
        Ok(self.states.lock().unwrap().iter()
            .map(|&state| DeviceStatus {state, error: false, code: 0})
            .collect())
    }
    fn set_clock_sync(&self, _index: u16, _params: Option<ClockParams>) -> RuntimeResult  {Ok(())}
    fn send_exchange(&self) {}
    fn receive_exchange(&self, _timeout: Duration) -> Exchange {
        Exchange {
            responses: 5,
            reference_time: self.start.elapsed().as_nanos() as i64,
        }
    }
    fn reconfigure(&self, index: u16, _timeout: Duration) -> RuntimeResult<AlState> {
        self.states.lock().unwrap()[usize::from(index) - 1] = AlState::SafeOperational;
        Ok(AlState::SafeOperational)
    }
    fn recover(&self, index: u16, _timeout: Duration) -> RuntimeResult {
        self.states.lock().unwrap()[usize::from(index) - 1] = AlState::Init;
        Ok(())
    }
    fn describe_status(&self, _code: u16) -> &'static str  {"no error"}
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = env::args().skip(1);
    let Some(endpoint) = args.next() else {
        eprintln!("usage: op_run <endpoint> [cycle-ms]");
        exit(1);
    };
    let cycle = args.next().map(|ms| Duration::from_millis(
        ms.parse().expect("cycle period must be a millisecond count")));

    let runtime = Arc::new(Runtime::new(Box::new(Simulated::new())));
    if let Err(err) = runtime.setup(&endpoint) {
        eprintln!("cannot set up the segment: {}", err);
        exit(1);
    }

    let sync = ClockParams {
        period: cycle.unwrap_or(Duration::from_millis(1)),
        secondary: Duration::ZERO,
        shift: 0,
    };
    if let Err(err) = runtime.bring_up(sync).await {
        eprintln!("bring-up failed: {}", err);
        exit(1);
    }

    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.supervise().await {
                error!("supervision stopped: {}", err);
            }
        });
    }

    // application output update: flip a marker bit every 30 cycles
    let mut marker = false;
    let output = move |cycle: u64| {
        if cycle % 30 == 0 {
            marker = ! marker;
            debug!("cycle {} marker {}", cycle, marker);
        }
    };

    match cycle {
        Some(period) => {
            spawn_realtime(runtime.clone(), period, Box::new(output))
                .expect("cannot spawn the exchange thread");
        }
        None => {
            let runtime = runtime.clone();
            tokio::spawn(async move {runtime.exchange_passive(output).await});
        }
    }

    tokio::signal::ctrl_c().await.expect("cannot listen for termination");
    runtime.shutdown();
}
