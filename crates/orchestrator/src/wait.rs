//! Poll-and-tick primitives. Time only passes here: every loop iteration
//! advances the simulation by one frame.

use std::time::Duration;
use tracing::{debug, warn};

use tor_core::{Result, Signal, Simulator, TorError};

use crate::context::Context;

/// Ticks until `duration` has elapsed on the context clock. Returns the
/// number of frames advanced; a zero duration advances nothing.
pub fn wait<S: Simulator>(ctx: &mut Context<S>, duration: Duration) -> Result<u64> {
    if duration.is_zero() {
        return Ok(0);
    }
    let deadline = ctx.clock.now() + duration;
    let mut ticks = 0;
    loop {
        ctx.advance()?;
        ticks += 1;
        if ctx.clock.now() >= deadline {
            break;
        }
    }
    debug!(secs = duration.as_secs_f64(), ticks, "wait finished");
    Ok(ticks)
}

/// Like [`wait`], for a duration in seconds. Zero, negative and NaN return
/// immediately; an infinite duration is rejected.
pub fn wait_seconds<S: Simulator>(ctx: &mut Context<S>, secs: f64) -> Result<u64> {
    if !(secs > 0.0) {
        return Ok(0);
    }
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| TorError::Other(anyhow::anyhow!("cannot wait for {secs} s: {e}")))?;
    wait(ctx, duration)
}

/// Takeover handshake: reads the signal channel, ticking once between reads,
/// until it holds `target`. Unavailable reads count as "not yet". Unbounded;
/// only an interrupt or a fatal stepper error ends it early.
pub fn wait_for_value<S: Simulator>(ctx: &mut Context<S>, target: Signal) -> Result<u64> {
    let mut ticks = 0;
    let mut unavailable = false;
    loop {
        match ctx.signal.read() {
            Ok(v) if v == target => return Ok(ticks),
            Ok(_) => unavailable = false,
            Err(e) => {
                if !unavailable {
                    warn!(error = %e, "signal channel unavailable, retrying every frame");
                }
                unavailable = true;
            }
        }
        ctx.advance()?;
        ticks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::*;
    use tor_core::{Clock, SignalChannel};
    use tor_sim_offline::OfflineConfig;

    #[test]
    fn zero_duration_does_not_tick() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        assert_eq!(wait(&mut ctx, Duration::ZERO).unwrap(), 0);
        assert_eq!(wait_seconds(&mut ctx, 0.0).unwrap(), 0);
        assert_eq!(wait_seconds(&mut ctx, -3.0).unwrap(), 0);
        assert_eq!(wait_seconds(&mut ctx, f64::NAN).unwrap(), 0);
        assert_eq!(probe.frame(), 0);
    }

    #[test]
    fn infinite_duration_is_rejected() {
        let (mut ctx, probe, _sig, _dir) = offline_context(OfflineConfig::default());
        assert!(wait_seconds(&mut ctx, f64::INFINITY).is_err());
        assert_eq!(probe.frame(), 0);
    }

    #[test]
    fn wait_ticks_at_least_ceil_of_duration_over_step() {
        for secs in [0.001, 0.025, 0.1, 1.0, 2.51, 10.0] {
            let (mut ctx, _probe, _sig, _dir) = offline_context(OfflineConfig::default());
            let start = ctx.clock.now();
            let ticks = wait_seconds(&mut ctx, secs).unwrap();
            let elapsed = (ctx.clock.now() - start).as_secs_f64();
            let min_ticks = (secs / STEP - 1e-9).ceil() as u64;
            assert!(ticks >= min_ticks.max(1), "{secs}s took {ticks} ticks");
            assert!(ticks <= min_ticks + 1, "{secs}s overshot with {ticks} ticks");
            assert!(elapsed + 1e-9 >= secs, "{secs}s returned after {elapsed}s");
        }
    }

    #[test]
    fn wait_for_value_returns_without_ticking_when_already_set() {
        let (mut ctx, probe, sig, _dir) = offline_context(OfflineConfig::default());
        sig.write(Signal::TakeoverRequested).unwrap();
        assert_eq!(wait_for_value(&mut ctx, Signal::TakeoverRequested).unwrap(), 0);
        assert_eq!(probe.frame(), 0);
    }

    #[test]
    fn wait_for_value_polls_through_missing_file() {
        let (mut ctx, probe, sig, _dir) = offline_context(OfflineConfig::default());
        // no file yet: reads fail until frame 5 writes Reserved, frame 9 writes the target
        let writer = sig.clone();
        probe.on_tick(move |frame| {
            if frame == 5 {
                writer.write(Signal::Reserved).unwrap();
            }
            if frame == 9 {
                writer.write(Signal::TakeoverRequested).unwrap();
            }
        });
        assert_eq!(wait_for_value(&mut ctx, Signal::TakeoverRequested).unwrap(), 9);
        assert_eq!(probe.frame(), 9);
    }

    #[test]
    fn wait_for_value_is_interruptible() {
        let (mut ctx, probe, sig, _dir) = offline_context(OfflineConfig::default());
        sig.write(Signal::Idle).unwrap();
        let interrupt = ctx.stepper.interrupt().clone();
        probe.on_tick(move |frame| {
            if frame == 3 {
                interrupt.raise();
            }
        });
        assert!(matches!(wait_for_value(&mut ctx, Signal::TakeoverRequested), Err(TorError::Interrupted)));
        assert_eq!(probe.frame(), 3);
    }
}
