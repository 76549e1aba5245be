use crossbeam_channel::Sender;
use tracing::debug;

use model::{EventRecord, SessionEvent};
use tor_core::{ActorId, Clock, Result, SignalChannel, Simulator, TorError};

use crate::stepper::Stepper;

pub type EventTx = Sender<EventRecord>;
pub type EventRx = crossbeam_channel::Receiver<EventRecord>;

pub fn event_channel() -> (EventTx, EventRx) {
    crossbeam_channel::unbounded()
}

/// Everything the scenario components share for one session: the stepper
/// (and through it the simulator), the wait clock, the operator signal
/// channel and the ego vehicle once it is known.
pub struct Context<S> {
    pub stepper: Stepper<S>,
    pub clock: Box<dyn Clock + Send>,
    pub signal: Box<dyn SignalChannel + Send>,
    pub ego: Option<ActorId>,
    pub tm_port: u16,
    events: Option<EventTx>,
    seq: u64,
}

impl<S: Simulator> Context<S> {
    pub fn new(
        stepper: Stepper<S>,
        clock: Box<dyn Clock + Send>,
        signal: Box<dyn SignalChannel + Send>,
        tm_port: u16,
    ) -> Self {
        Self { stepper, clock, signal, ego: None, tm_port, events: None, seq: 0 }
    }

    pub fn with_events(mut self, tx: EventTx) -> Self {
        self.attach_events(tx);
        self
    }

    pub fn attach_events(&mut self, tx: EventTx) {
        self.events = Some(tx);
    }

    pub fn sim(&self) -> &S { self.stepper.sim() }

    pub fn sim_mut(&mut self) -> &mut S { self.stepper.sim_mut() }

    pub fn advance(&mut self) -> Result<u64> { self.stepper.advance() }

    pub fn ego(&self) -> Result<ActorId> { self.ego.ok_or(TorError::EgoVehicleMissing) }

    pub fn set_autopilot(&mut self, actor: ActorId, enabled: bool) -> Result<()> {
        let port = self.tm_port;
        self.sim_mut().set_autopilot(actor, enabled, port)?;
        self.emit(SessionEvent::AutopilotChanged { actor, enabled });
        Ok(())
    }

    /// Stamps the event with the current frame and forwards it to the
    /// recorder, if one is attached. A gone recorder is not an error.
    pub fn emit(&mut self, event: SessionEvent) {
        let Some(tx) = &self.events else { return };
        let rec = EventRecord {
            seq: self.seq,
            frame: self.stepper.last_frame(),
            sim_time_s: self.stepper.sim().elapsed_seconds(),
            event,
        };
        self.seq += 1;
        if tx.send(rec).is_err() {
            debug!("event recorder disconnected");
            self.events = None;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::stepper::TickMode;
    use tempfile::TempDir;
    use tor_core::Interrupt;
    use tor_io::SignalFile;
    use tor_sim_offline::{OfflineConfig, OfflineSim};

    pub const STEP: f64 = 0.025;

    /// Synchronous offline world with a sim-time clock and a signal file in a
    /// temp dir. Returns a probe handle on the same world.
    pub fn offline_context(cfg: OfflineConfig) -> (Context<OfflineSim>, OfflineSim, SignalFile, TempDir) {
        let sim = OfflineSim::new(cfg);
        sim.set_synchronous(true, Some(STEP));
        let probe = sim.clone();
        let dir = tempfile::tempdir().unwrap();
        let signal = SignalFile::new(dir.path().join("SignalFile.txt"));
        let clock = sim.clock();
        let mut ctx = Context::new(
            Stepper::new(sim, TickMode::Synchronous, Interrupt::new()),
            Box::new(clock),
            Box::new(signal.clone()),
            8000,
        );
        ctx.ego = probe.ego();
        (ctx, probe, signal, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tor_sim_offline::OfflineConfig;

    #[test]
    fn emitted_events_carry_frame_and_sequence() {
        let (ctx, _probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let (tx, rx) = event_channel();
        let mut ctx = ctx.with_events(tx);
        ctx.advance().unwrap();
        ctx.advance().unwrap();
        let ego = ctx.ego().unwrap();
        ctx.set_autopilot(ego, true).unwrap();
        ctx.emit(SessionEvent::TakeoverObserved { value: 2 });
        let recs: Vec<EventRecord> = rx.try_iter().collect();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].seq, 0);
        assert_eq!(recs[1].seq, 1);
        assert_eq!(recs[1].frame, 2);
        assert!((recs[1].sim_time_s - 2.0 * STEP).abs() < 1e-9);
    }

    #[test]
    fn emit_survives_dropped_receiver() {
        let (ctx, _probe, _sig, _dir) = offline_context(OfflineConfig::default());
        let (tx, rx) = event_channel();
        let mut ctx = ctx.with_events(tx);
        drop(rx);
        ctx.emit(SessionEvent::SignalWritten { value: 0 });
        ctx.emit(SessionEvent::SignalWritten { value: 0 });
    }

    #[test]
    fn missing_ego_is_reported() {
        let (mut ctx, _probe, _sig, _dir) = offline_context(OfflineConfig::default());
        ctx.ego = None;
        assert!(matches!(ctx.ego(), Err(TorError::EgoVehicleMissing)));
    }
}
