use serde::{Deserialize, Serialize};
use tracing::trace;

use tor_core::{Interrupt, Result, Simulator, TorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// This process owns the clock: every advance is one fixed step.
    Synchronous,
    /// Someone else drives the server; advance waits for the next frame.
    Asynchronous,
}

/// Owns the simulator handle and is the only place frames are advanced.
pub struct Stepper<S> {
    sim: S,
    mode: TickMode,
    interrupt: Interrupt,
    frames: u64,
    last_frame: u64,
}

impl<S: Simulator> Stepper<S> {
    pub fn new(sim: S, mode: TickMode, interrupt: Interrupt) -> Self {
        Self { sim, mode, interrupt, frames: 0, last_frame: 0 }
    }

    /// Blocks until one frame is committed. Fails with `Interrupted` once the
    /// operator raised the abort flag, before touching the simulator.
    pub fn advance(&mut self) -> Result<u64> {
        if self.interrupt.is_raised() {
            return Err(TorError::Interrupted);
        }
        let frame = match self.mode {
            TickMode::Synchronous => self.sim.tick()?,
            TickMode::Asynchronous => self.sim.wait_for_tick()?,
        };
        self.frames += 1;
        self.last_frame = frame;
        trace!(frame, "frame committed");
        Ok(frame)
    }

    pub fn sim(&self) -> &S { &self.sim }

    pub fn sim_mut(&mut self) -> &mut S { &mut self.sim }

    pub fn mode(&self) -> TickMode { self.mode }

    pub fn set_mode(&mut self, mode: TickMode) { self.mode = mode; }

    /// Frames advanced through this stepper.
    pub fn frames(&self) -> u64 { self.frames }

    /// Engine frame number of the last advance.
    pub fn last_frame(&self) -> u64 { self.last_frame }

    pub fn interrupt(&self) -> &Interrupt { &self.interrupt }
}
