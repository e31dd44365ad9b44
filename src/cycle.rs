/*!
    The cyclic process-data exchange loops and the context they share with the supervisor.

    Two loops are provided, selected once at startup:

    - [passive](crate::runtime::Runtime::exchange_passive) runs on the caller's task with plain sleeps between cycles, for setups without realtime constraints
    - [realtime](crate::runtime::Runtime::exchange_realtime) runs with an absolute-deadline timer and is meant for a dedicated prioritized thread, see [spawn_realtime]

    Both loops publish the same [CycleContext] fields so the supervisor behaves identically regardless of the mode. Send and receive are pipelined one cycle apart in realtime mode: the response received in one cycle answers the frame sent in the previous one, and the loop never reorders that relationship.
*/

use crate::{
    clock::PhaseLock,
    error::RuntimeResult,
    runtime::Runtime,
    transport::{timeout, Transport},
    };
use core::sync::atomic::{
    AtomicBool, AtomicI64, AtomicU16, AtomicU64,
    Ordering::*,
    };
use core::time::Duration;
use std::{sync::Arc, time::Instant};

use log::{debug, warn};
use tokio_timerfd::Delay;

/// iteration bound of the passive loop, effectively unbounded: the intended termination path is [Runtime::shutdown], not loop exit
const PASSIVE_LIMIT: u64 = 100_000_000;
/// backoff after a cycle whose response count fell short of expectation
const SHORTFALL_BACKOFF: Duration = Duration::from_millis(5);

/**
    in-flight exchange state shared between the cyclic loop and the supervisor.

    Every field is an independent atomic: the supervisor is a reconciliation loop tolerating stale reads, no cross-field invariant is needed. This context is never protected by the registry mutex, it is read far more often than written.
*/
#[derive(Debug, Default)]
pub struct CycleContext {
    running: AtomicBool,
    operational: AtomicBool,
    responses: AtomicU16,
    expected: AtomicU16,
    cycles: AtomicU64,
    reference_time: AtomicI64,
    delta: AtomicI64,
    period: AtomicI64,
    elapsed: AtomicI64,
}
impl CycleContext {
    pub fn new() -> Self  {Self::default()}

    /// the cyclic loops keep iterating while this flag is set
    pub fn running(&self) -> bool  {self.running.load(SeqCst)}
    pub fn set_running(&self, value: bool)  {self.running.store(value, SeqCst)}

    /// set once when bring-up succeeds, cleared by shutdown; gates the supervisor
    pub fn operational(&self) -> bool  {self.operational.load(SeqCst)}
    pub fn set_operational(&self, value: bool)  {self.operational.store(value, SeqCst)}

    /// most recent observed response count
    pub fn responses(&self) -> u16  {self.responses.load(SeqCst)}
    pub fn set_responses(&self, value: u16)  {self.responses.store(value, SeqCst)}

    /// expected response count computed at bring-up
    pub fn expected(&self) -> u16  {self.expected.load(SeqCst)}
    pub fn set_expected(&self, value: u16)  {self.expected.store(value, SeqCst)}

    /// true when the last exchange was answered by fewer devices than expected
    pub fn shortfall(&self) -> bool  {self.responses() < self.expected()}

    /// number of completed cycles
    pub fn cycle(&self) -> u64  {self.cycles.load(SeqCst)}
    pub(crate) fn advance(&self) -> u64  {self.cycles.fetch_add(1, SeqCst) + 1}

    /// latest reference-clock timestamp, nanoseconds
    pub fn reference_time(&self) -> i64  {self.reference_time.load(SeqCst)}
    pub(crate) fn set_reference_time(&self, value: i64)  {self.reference_time.store(value, SeqCst)}

    /// latest phase error measured by the clock synchronizer, nanoseconds
    pub fn delta(&self) -> i64  {self.delta.load(SeqCst)}
    pub(crate) fn set_delta(&self, value: i64)  {self.delta.store(value, SeqCst)}

    /// target cycle period of the running loop, nanoseconds
    pub fn period(&self) -> i64  {self.period.load(SeqCst)}
    pub(crate) fn set_period(&self, value: i64)  {self.period.store(value, SeqCst)}

    /// measured duration of the last completed cycle, nanoseconds
    pub fn elapsed(&self) -> i64  {self.elapsed.load(SeqCst)}
    pub(crate) fn set_elapsed(&self, value: i64)  {self.elapsed.store(value, SeqCst)}
}

/// passive repeat-until-count loop, see the module documentation
pub(crate) async fn passive(
    transport: &dyn Transport,
    context: &CycleContext,
    pacing: Duration,
    mut output: impl FnMut(u64),
) {
    context.set_period(pacing.as_nanos() as i64);
    let mut last = Instant::now();

    for _ in 0 .. PASSIVE_LIMIT {
        if ! context.running()  {break}
        context.set_elapsed(last.elapsed().as_nanos() as i64);
        last = Instant::now();

        output(context.cycle() + 1);
        transport.send_exchange();
        let exchange = transport.receive_exchange(timeout::RETURN);
        context.set_responses(exchange.responses);
        context.set_reference_time(exchange.reference_time);
        let cycle = context.advance();

        if exchange.responses < context.expected() {
            warn!("cycle {}: {} responses, expected {}",
                cycle, exchange.responses, context.expected());
            tokio::time::sleep(SHORTFALL_BACKOFF).await;
            continue;
        }
        debug!("cycle {} responses {} reference {}",
            cycle, exchange.responses, exchange.reference_time);
        tokio::time::sleep(pacing).await;
    }
}

/// absolute-deadline realtime loop, see the module documentation
pub(crate) async fn realtime(
    transport: &dyn Transport,
    context: &CycleContext,
    mut clock: PhaseLock,
    phase_locked: bool,
    mut output: impl FnMut(u64),
) -> RuntimeResult {
    let period = i64::try_from(clock.period().as_nanos()).unwrap_or(i64::MAX);
    context.set_period(period);
    let mut wake = Instant::now();
    let mut last = wake;
    let mut offset = 0i64;

    // seed the pipeline so the first receive has a frame to answer
    transport.send_exchange();

    loop {
        // the correction shrinks or stretches this one period, it never reorders cycles
        wake += Duration::from_nanos((period + offset).max(0) as u64);
        Delay::new(wake)?.await?;
        if ! context.running()  {break}
        context.set_elapsed(last.elapsed().as_nanos() as i64);
        last = Instant::now();

        let exchange = transport.receive_exchange(timeout::RETURN);
        context.set_responses(exchange.responses);
        context.set_reference_time(exchange.reference_time);
        let cycle = context.advance();

        output(cycle);

        if phase_locked {
            offset = clock.correct(exchange.reference_time);
            context.set_delta(clock.last_delta());
        }
        transport.send_exchange();
    }
    Ok(())
}

/**
    run the realtime exchange loop on a dedicated thread.

    The thread is raised to the maximum priority with FIFO scheduling and realtime io priority where the platform permits; failing to raise it is reported but not fatal, the loop then runs at normal priority.
*/
pub fn spawn_realtime(
    runtime: Arc<Runtime>,
    period: Duration,
    output: Box<dyn FnMut(u64) + Send>,
) -> std::io::Result<std::thread::JoinHandle<RuntimeResult>> {
    std::thread::Builder::new()
        .name("cyclic-exchange".into())
        .spawn(move || {
            #[cfg(target_os = "linux")]
            if let Err(err) = thread_priority::set_thread_priority_and_policy(
                    thread_priority::thread_native_id(),
                    thread_priority::ThreadPriority::Max,
                    thread_priority::ThreadSchedulePolicy::Realtime(
                        thread_priority::RealtimeThreadSchedulePolicy::Fifo),
                    ) {
                warn!("cannot raise exchange thread priority: {:?}", err);
            }
            if let Err(err) = ioprio::set_priority(
                    ioprio::Target::Process(ioprio::Pid::this()),
                    ioprio::Priority::new(ioprio::Class::Realtime(
                        ioprio::RtPriorityLevel::highest())),
                    ) {
                warn!("cannot raise exchange io priority: {:?}", err);
            }
            let local = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            local.block_on(runtime.exchange_realtime(period, output))
        })
}
