/*!
    Phase locking of the local cyclic loop to the distributed reference clock.

    The reference clock lives on the first clock-capable device, not on the master: the master's wake time must follow it, not the other way around. [PhaseLock] is the proportional-integral controller computing, from the reference timestamp returned with each exchange, the offset to add to the next wake time of the realtime loop.

    The controller deliberately targets a point 50µs after the reference edge, so the local wake never races the devices' sync impulse at the period boundary.
*/

use crate::error::{RuntimeError, RuntimeResult};
use core::time::Duration;

/// bias of the local wake point past the reference edge, in nanoseconds
const EDGE_BIAS: i64 = 50_000;

/**
    PI controller keeping the local cyclic loop phase-locked to the reference clock.

    State is one signed integral accumulator, owned exclusively by the realtime loop's execution context. The proportional term is scaled by 1/100 and the integral term by 1/20, both with truncating division; the integral is a bang-bang accumulator stepping by one per cycle with the sign of the measured error.
*/
#[derive(Debug)]
pub struct PhaseLock {
    period: i64,
    integral: i64,
    delta: i64,
}
impl PhaseLock {
    /// controller for the given cycle period, a zero period is a configuration error
    pub fn new(period: Duration) -> RuntimeResult<Self> {
        let period = i64::try_from(period.as_nanos())
            .map_err(|_| RuntimeError::Config("cycle period must be below 292 years"))?;
        if period <= 0
            {return Err(RuntimeError::Config("cycle period must not be zero"))}
        Ok(Self {period, integral: 0, delta: 0})
    }

    /// cycle period the controller was built for
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period as u64)
    }

    /**
        one controller step: fold the reference timestamp into a phase error and return the offset to add to the next wake time

        The error is folded into `(-period/2, period/2]` so the correction always takes the short way around the period.
    */
    pub fn correct(&mut self, reference_time: i64) -> i64 {
        let mut delta = (reference_time - EDGE_BIAS).rem_euclid(self.period);
        if delta > self.period / 2 {
            delta -= self.period;
        }
        if delta > 0  {self.integral += 1}
        if delta < 0  {self.integral -= 1}
        self.delta = delta;
        -(delta / 100) - (self.integral / 20)
    }

    /// phase error measured by the last [Self::correct] call, for diagnostics
    pub fn last_delta(&self) -> i64  {self.delta}

    /// current integral accumulator, for diagnostics
    pub fn integral(&self) -> i64  {self.integral}
}
