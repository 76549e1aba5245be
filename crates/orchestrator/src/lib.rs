//! Tick-synchronized orchestration of a TOR session: stepping, waits, the
//! lane-change maneuver, scenario dispatch, background population and the
//! session state machine that ties them together.

pub mod config;
pub mod context;
pub mod maneuver;
pub mod population;
pub mod scenario;
pub mod session;
pub mod stepper;
pub mod wait;

pub use config::SessionConfig;
pub use context::{event_channel, Context, EventRx, EventTx};
pub use session::{Session, SessionOutcome};
pub use stepper::{Stepper, TickMode};
