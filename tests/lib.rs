use etherop::{
    AlState, ClockParams, Configured, DeviceConfig, DeviceControl, DeviceStatus,
    Exchange, GroupConfig, GroupRecord, PhaseLock, Runtime, RuntimeError, RuntimeResult,
    SyncRole, Target, Transport,
    };
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
    };

/// every transport call a test may want to assert on
#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Open(String),
    Close,
    Configure,
    RequestState(Target, DeviceControl),
    WaitState(Target, AlState),
    ReadStates,
    SetClockSync(u16, bool),
    Send,
    Receive,
    Reconfigure(u16),
    Recover(u16),
}

/// scripted transport: reports a fixed segment and records every call
struct Mock {
    calls: Mutex<Vec<Call>>,
    devices: Vec<DeviceConfig>,
    group: GroupConfig,
    /// statuses served by `read_states`
    states: Mutex<Vec<DeviceStatus>>,
    /// group `wait_state` outcome per requested state, requests not listed succeed
    group_waits: Mutex<HashMap<AlState, AlState>>,
    /// single-device `wait_state` outcome, devices not listed stay silent
    device_waits: Mutex<HashMap<u16, AlState>>,
    /// devices whose reconfiguration succeeds, with the state they end in
    reconfigures: Mutex<HashMap<u16, AlState>>,
    /// devices whose recovery succeeds
    recovers: Mutex<HashSet<u16>>,
    /// response count served by `receive_exchange`
    responses: Mutex<u16>,
}

impl Mock {
    /// three devices in one group, device 2 clock-capable, expected responses (2 x 2) + 1
    fn segment() -> Self {
        let device = |name: &str, clock_capable, output_bits, input_bits| DeviceConfig {
            name: name.into(),
            clock_capable,
            output_bytes: output_bits / 8,
            output_bits,
            input_bytes: input_bits / 8,
            input_bits,
            group: 0,
        };
        Self {
            calls: Mutex::new(Vec::new()),
            devices: vec![
                device("coupler", false, 0, 16),
                device("drive", true, 64, 64),
                device("io block", false, 16, 16),
            ],
            group: GroupConfig {
                expected_outputs: 2,
                expected_inputs: 1,
                segments: vec![10, 12],
            },
            states: Mutex::new(vec![DeviceStatus::default(); 3]),
            group_waits: Mutex::new(HashMap::new()),
            device_waits: Mutex::new(HashMap::new()),
            reconfigures: Mutex::new(HashMap::new()),
            recovers: Mutex::new(HashSet::new()),
            responses: Mutex::new(0),
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
    fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.calls().into_iter().filter(|call| filter(call)).count()
    }
    fn set_states(&self, states: &[(AlState, bool)]) {
        *self.states.lock().unwrap() = states.iter()
            .map(|&(state, error)| DeviceStatus {state, error, code: if error {0x1e} else {0}})
            .collect();
    }
}

impl Transport for Mock {
    fn open(&self, endpoint: &str) -> RuntimeResult {
        self.record(Call::Open(endpoint.into()));
        Ok(())
    }
    fn close(&self) {
        self.record(Call::Close);
    }
    fn configure(&self) -> RuntimeResult<Configured> {
        self.record(Call::Configure);
        Ok(Configured {
            devices: self.devices.clone(),
            groups: vec![self.group.clone()],
        })
    }
    fn clock_capable(&self) -> bool {
        self.devices.iter().any(|device| device.clock_capable)
    }
    fn request_state(&self, target: Target, control: DeviceControl) -> RuntimeResult {
        self.record(Call::RequestState(target, control));
        Ok(())
    }
    fn wait_state(&self, target: Target, state: AlState, _timeout: Duration) -> AlState {
        self.record(Call::WaitState(target, state));
        match target {
            Target::Group => self.group_waits.lock().unwrap()
                .get(&state).copied().unwrap_or(state),
            Target::Device(index) => self.device_waits.lock().unwrap()
                .get(&index).copied().unwrap_or(AlState::None),
        }
    }
    fn read_states(&self) -> RuntimeResult<Vec<DeviceStatus>> {
        self.record(Call::ReadStates);
        Ok(self.states.lock().unwrap().clone())
    }
    fn set_clock_sync(&self, index: u16, params: Option<ClockParams>) -> RuntimeResult {
        self.record(Call::SetClockSync(index, params.is_some()));
        Ok(())
    }
    fn send_exchange(&self) {
        self.record(Call::Send);
    }
    fn receive_exchange(&self, _timeout: Duration) -> Exchange {
        self.record(Call::Receive);
        Exchange {
            responses: *self.responses.lock().unwrap(),
            reference_time: 0,
        }
    }
    fn reconfigure(&self, index: u16, _timeout: Duration) -> RuntimeResult<AlState> {
        self.record(Call::Reconfigure(index));
        self.reconfigures.lock().unwrap()
            .get(&index).copied()
            .ok_or(RuntimeError::Timeout("reconfiguration refused"))
    }
    fn recover(&self, index: u16, _timeout: Duration) -> RuntimeResult {
        self.record(Call::Recover(index));
        if self.recovers.lock().unwrap().contains(&index)
            {Ok(())} else {Err(RuntimeError::Timeout("recovery refused"))}
    }
    fn describe_status(&self, _code: u16) -> &'static str {
        "scripted status"
    }
}

/// runtime over a fresh mock segment, already set up
fn runtime(mock: Mock) -> (Arc<Runtime>, Arc<Mock>) {
    let mock = Arc::new(mock);
    let runtime = Arc::new(Runtime::new(Box::new(SharedMock(mock.clone()))));
    runtime.setup("mock0").unwrap();
    (runtime, mock)
}

/// lets a test keep a handle on the mock the runtime owns
struct SharedMock(Arc<Mock>);
impl Transport for SharedMock {
    fn open(&self, endpoint: &str) -> RuntimeResult  {self.0.open(endpoint)}
    fn close(&self)  {self.0.close()}
    fn configure(&self) -> RuntimeResult<Configured>  {self.0.configure()}
    fn clock_capable(&self) -> bool  {self.0.clock_capable()}
    fn request_state(&self, target: Target, control: DeviceControl) -> RuntimeResult  {self.0.request_state(target, control)}
    fn wait_state(&self, target: Target, state: AlState, timeout: Duration) -> AlState  {self.0.wait_state(target, state, timeout)}
    fn read_states(&self) -> RuntimeResult<Vec<DeviceStatus>>  {self.0.read_states()}
    fn set_clock_sync(&self, index: u16, params: Option<ClockParams>) -> RuntimeResult  {self.0.set_clock_sync(index, params)}
    fn send_exchange(&self)  {self.0.send_exchange()}
    fn receive_exchange(&self, timeout: Duration) -> Exchange  {self.0.receive_exchange(timeout)}
    fn reconfigure(&self, index: u16, timeout: Duration) -> RuntimeResult<AlState>  {self.0.reconfigure(index, timeout)}
    fn recover(&self, index: u16, timeout: Duration) -> RuntimeResult  {self.0.recover(index, timeout)}
    fn describe_status(&self, code: u16) -> &'static str  {self.0.describe_status(code)}
}

// ---- clock synchronizer ----

#[test]
fn phase_error_stays_in_half_period() {
    for period in [1_000_000i64, 500_000, 2_000_000, 333_333] {
        let mut clock = PhaseLock::new(Duration::from_nanos(period as u64)).unwrap();
        for reference in [0i64, 1, 49_999, 50_000, 50_001, 499_999, 500_000,
                          999_999, 1_000_000, 1_234_567_890, -1, -50_000, -999_999] {
            clock.correct(reference);
            let delta = clock.last_delta();
            assert!(delta > -(period / 2) && delta <= period / 2,
                "delta {} out of range for period {} reference {}", delta, period, reference);
        }
    }
}

#[test]
fn integral_follows_constant_error_sign() {
    let period = 1_000_000i64;
    let mut clock = PhaseLock::new(Duration::from_nanos(period as u64)).unwrap();
    let mut previous = clock.integral();
    for k in 0 .. 5 {
        // phase error of +100ns every cycle
        clock.correct(50_000 + 100 + k * period);
        assert!(clock.integral() > previous);
        previous = clock.integral();
    }

    let mut clock = PhaseLock::new(Duration::from_nanos(period as u64)).unwrap();
    let mut previous = clock.integral();
    for k in 0 .. 5 {
        clock.correct(50_000 - 100 + k * period);
        assert!(clock.integral() < previous);
        previous = clock.integral();
    }
}

#[test]
fn zero_period_is_a_config_error() {
    assert!(matches!(
        PhaseLock::new(Duration::ZERO),
        Err(RuntimeError::Config(_)),
        ));
}

// ---- response accounting ----

#[test]
fn expected_responses_count_outputs_twice() {
    let group = GroupRecord {
        expected_outputs: 2,
        expected_inputs: 1,
        .. Default::default()
    };
    assert_eq!(group.expected_responses(), 5);
}

#[test]
fn exact_response_count_never_triggers_supervision() {
    let (runtime, _mock) = runtime(Mock::segment());
    runtime.context().set_operational(true);
    runtime.context().set_expected(5);

    runtime.context().set_responses(5);
    assert!(! runtime.supervision_pending());

    runtime.context().set_responses(4);
    assert!(runtime.supervision_pending());

    // never while not in operation
    runtime.context().set_operational(false);
    assert!(! runtime.supervision_pending());
}

// ---- supervisor transition table ----

#[test]
fn safeop_error_is_acknowledged() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::SafeOperational, true),
        (AlState::Operational, false),
        (AlState::Operational, false),
    ]);
    runtime.reconcile().unwrap();
    assert!(mock.calls().contains(
        &Call::RequestState(Target::Device(1), DeviceControl::acknowledge(AlState::SafeOperational))));
}

#[test]
fn safeop_is_pushed_to_operational() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::Operational, false),
        (AlState::SafeOperational, false),
        (AlState::Operational, false),
    ]);
    runtime.reconcile().unwrap();
    assert!(mock.calls().contains(
        &Call::RequestState(Target::Device(2), DeviceControl::request(AlState::Operational))));
}

#[test]
fn other_states_get_reconfigured() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::Operational, false),
        (AlState::Operational, false),
        (AlState::Init, false),
    ]);
    mock.reconfigures.lock().unwrap().insert(3, AlState::PreOperational);
    runtime.reconcile().unwrap();
    assert!(mock.calls().contains(&Call::Reconfigure(3)));
    assert_eq!(runtime.registry().lock().unwrap().device(3).unwrap().state,
        AlState::PreOperational);
}

#[test]
fn silent_device_is_repolled_then_marked_lost() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::None, false),
        (AlState::Operational, false),
        (AlState::Operational, false),
    ]);
    // the re-poll still sees nothing, the device is declared lost and recovery is attempted
    runtime.reconcile().unwrap();
    let calls = mock.calls();
    assert!(calls.contains(&Call::WaitState(Target::Device(1), AlState::Operational)));
    assert!(calls.contains(&Call::Recover(1)));
    assert!(runtime.registry().lock().unwrap().device(1).unwrap().lost);
}

#[test]
fn reappeared_device_is_found_without_recovery() {
    let (runtime, mock) = runtime(Mock::segment());
    runtime.registry().lock().unwrap().device_mut(1).unwrap().lost = true;
    mock.set_states(&[
        (AlState::Operational, false),
        (AlState::Operational, false),
        (AlState::Operational, false),
    ]);
    runtime.reconcile().unwrap();
    assert!(! runtime.registry().lock().unwrap().device(1).unwrap().lost);
    assert_eq!(mock.count(|call| matches!(call, Call::Recover(_))), 0);
}

#[test]
fn reconciliation_is_idempotent() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::Operational, false),
        (AlState::Operational, false),
        (AlState::Operational, false),
    ]);
    mock.calls.lock().unwrap().clear();
    runtime.reconcile().unwrap();
    runtime.reconcile().unwrap();
    // nothing beyond the two mandatory state refreshes
    assert_eq!(mock.calls(), vec![Call::ReadStates, Call::ReadStates]);
}

// ---- bring-up ----

const SYNC: ClockParams = ClockParams {
    period: Duration::from_millis(1),
    secondary: Duration::ZERO,
    shift: 0,
};

#[tokio::test]
async fn bringup_reaches_operation_exactly_once() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
    ]);
    runtime.bring_up(SYNC).await.unwrap();

    // sync enabled on the one clock-capable device only
    assert_eq!(mock.count(|call| matches!(call, Call::SetClockSync(_, true))), 1);
    assert!(mock.calls().contains(&Call::SetClockSync(2, true)));
    assert_eq!(runtime.registry().lock().unwrap().device(2).unwrap().sync,
        SyncRole::Sync0 {period: SYNC.period});

    // expected response accounting published to the cyclic context
    assert_eq!(runtime.context().expected(), 5);

    // exactly one priming exchange before the operational request
    let calls = mock.calls();
    let request = calls.iter().position(|call| *call ==
        Call::RequestState(Target::Group, DeviceControl::request(AlState::Operational)))
        .unwrap();
    assert_eq!(calls[.. request].iter().filter(|call| **call == Call::Send).count(), 1);
    assert_eq!(calls[.. request].iter().filter(|call| **call == Call::Receive).count(), 1);

    assert!(runtime.context().operational());
    assert!(runtime.context().running());
}

#[tokio::test]
async fn bringup_aborts_when_safeop_is_not_reached() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.group_waits.lock().unwrap().insert(AlState::SafeOperational, AlState::Init);
    mock.set_states(&[
        (AlState::Init, false),
        (AlState::Init, false),
        (AlState::Init, false),
    ]);
    assert!(matches!(
        runtime.bring_up(SYNC).await,
        Err(RuntimeError::Timeout(_)),
        ));
    // diagnostics were refreshed, nothing was primed, operation never started
    assert!(mock.calls().contains(&Call::ReadStates));
    assert_eq!(mock.count(|call| matches!(call, Call::Send)), 0);
    assert!(! runtime.context().operational());
}

#[tokio::test]
async fn bringup_exhausts_its_operational_attempts() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.group_waits.lock().unwrap().insert(AlState::Operational, AlState::SafeOperational);
    mock.set_states(&[
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
    ]);
    assert!(matches!(
        runtime.bring_up(SYNC).await,
        Err(RuntimeError::Timeout(_)),
        ));
    // one priming exchange plus one per polling attempt
    assert_eq!(mock.count(|call| matches!(call, Call::Send)), 41);
    assert!(! runtime.context().operational());
}

// ---- exchange loops ----

#[tokio::test]
async fn passive_loop_stops_when_the_run_flag_clears() {
    let (runtime, mock) = runtime(Mock::segment());
    runtime.context().set_running(true);
    let context = runtime.context().clone();
    runtime.exchange_passive(move |cycle| {
        if cycle >= 3  {context.set_running(false)}
    }).await;
    assert_eq!(mock.count(|call| matches!(call, Call::Send)), 3);
}

#[tokio::test]
async fn passive_loop_survives_a_response_shortfall() {
    let (runtime, mock) = runtime(Mock::segment());
    runtime.context().set_expected(5);
    *mock.responses.lock().unwrap() = 3;
    runtime.context().set_running(true);
    let context = runtime.context().clone();
    runtime.exchange_passive(move |cycle| {
        if cycle >= 3  {context.set_running(false)}
    }).await;
    // every short cycle is backed off and retried, never escalated
    assert_eq!(mock.count(|call| matches!(call, Call::Send)), 3);
    assert!(runtime.context().shortfall());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn realtime_loop_pipelines_sends_one_cycle_ahead() {
    let (runtime, mock) = runtime(Mock::segment());
    runtime.context().set_running(true);
    let context = runtime.context().clone();
    runtime.exchange_realtime(Duration::from_millis(1), move |cycle| {
        if cycle >= 3  {context.set_running(false)}
    }).await.unwrap();
    let sends = mock.count(|call| matches!(call, Call::Send));
    let receives = mock.count(|call| matches!(call, Call::Receive));
    assert_eq!(receives, 3);
    assert_eq!(sends, receives + 1);
}

#[tokio::test]
async fn zero_cycle_period_is_rejected_before_the_loop() {
    let (runtime, mock) = runtime(Mock::segment());
    runtime.context().set_running(true);
    assert!(matches!(
        runtime.exchange_realtime(Duration::ZERO, |_| ()).await,
        Err(RuntimeError::Config(_)),
        ));
    assert_eq!(mock.count(|call| matches!(call, Call::Send)), 0);
}

// ---- shutdown ----

#[tokio::test]
async fn shutdown_is_reentrant() {
    let (runtime, mock) = runtime(Mock::segment());
    mock.set_states(&[
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
        (AlState::SafeOperational, false),
    ]);
    runtime.bring_up(SYNC).await.unwrap();

    runtime.shutdown();
    runtime.shutdown();

    assert!(! runtime.context().running());
    assert!(! runtime.context().operational());
    // sync is disabled once, the second call finds nothing enabled
    assert_eq!(mock.count(|call| *call == Call::SetClockSync(2, false)), 1);
    assert_eq!(mock.count(|call| *call ==
        Call::RequestState(Target::Group, DeviceControl::request(AlState::Init))), 2);
    assert_eq!(mock.count(|call| *call == Call::Close), 2);
}

// ---- setup ----

#[test]
fn empty_segment_is_fatal() {
    let mut mock = Mock::segment();
    mock.devices.clear();
    let runtime = Runtime::new(Box::new(mock));
    assert!(matches!(
        runtime.setup("mock0"),
        Err(RuntimeError::Master(_)),
        ));
}
