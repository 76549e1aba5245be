use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tor_core::{ActorId, LaneChange, ScenarioKind, TrafficLightState, WeatherParameters};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    WatchingForTrigger,
    RunningScenario,
    Restoring,
    TornDown,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub frame: u64,
    pub sim_time_s: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged { phase: Phase },
    PopulationSpawned { vehicles: usize, walkers: usize },
    SignalWritten { value: i64 },
    TakeoverObserved { value: i64 },
    TrafficLightChanged { light: ActorId, from: TrafficLightState, to: TrafficLightState },
    AutopilotChanged { actor: ActorId, enabled: bool },
    ManeuverStarted { direction: LaneChange, heading_delta_deg: f64, duration_s: f64 },
    ManeuverFinished { ticks: u64 },
    WeatherApplied { weather: WeatherParameters },
    WeatherRestored { weather: WeatherParameters },
    ScenarioFinished { scenario: ScenarioKind, outcome: ScenarioOutcome },
    TeardownFinished { vehicles: usize, walkers: usize, errors: usize },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::PhaseChanged { .. } => "phase_changed",
            SessionEvent::PopulationSpawned { .. } => "population_spawned",
            SessionEvent::SignalWritten { .. } => "signal_written",
            SessionEvent::TakeoverObserved { .. } => "takeover_observed",
            SessionEvent::TrafficLightChanged { .. } => "traffic_light_changed",
            SessionEvent::AutopilotChanged { .. } => "autopilot_changed",
            SessionEvent::ManeuverStarted { .. } => "maneuver_started",
            SessionEvent::ManeuverFinished { .. } => "maneuver_finished",
            SessionEvent::WeatherApplied { .. } => "weather_applied",
            SessionEvent::WeatherRestored { .. } => "weather_restored",
            SessionEvent::ScenarioFinished { .. } => "scenario_finished",
            SessionEvent::TeardownFinished { .. } => "teardown_finished",
        }
    }
}

/// Event stamped with the frame it was observed on.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct EventRecord {
    pub seq: u64,
    pub frame: u64,
    pub sim_time_s: f64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Completed,
    Skipped(String),
    NotReached,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ManeuverRecord {
    pub direction: LaneChange,
    pub heading_delta_deg: f64,
    pub speed_mps: f64,
    pub lane_width_m: f64,
    pub duration_s: f64,
    pub ticks: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct TeardownReport {
    pub settings_restored: bool,
    pub vehicles_destroyed: usize,
    pub walkers_destroyed: usize,
    pub controllers_stopped: usize,
    pub ego_autopilot_disabled: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SessionReport {
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    pub started_at: String,
    pub scenario: ScenarioKind,
    pub trigger_frame: Option<u64>,
    pub frames: u64,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    pub maneuver: Option<ManeuverRecord>,
    pub outcome: ScenarioOutcome,
    pub teardown: TeardownReport,
    pub error: Option<String>,
}

impl SessionReport {
    pub fn new(scenario: ScenarioKind, started_at: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            scenario,
            trigger_frame: None,
            frames: 0,
            phases: vec![],
            maneuver: None,
            outcome: ScenarioOutcome::NotReached,
            teardown: TeardownReport::default(),
            error: None,
        }
    }

    pub fn last_phase(&self) -> Option<Phase> {
        self.phases.last().map(|p| p.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_record_flattens_tag() {
        let rec = EventRecord {
            seq: 3,
            frame: 120,
            sim_time_s: 3.0,
            event: SessionEvent::TakeoverObserved { value: 2 },
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["event"], "takeover_observed");
        assert_eq!(v["frame"], 120);
        assert_eq!(v["value"], 2);
        let back: EventRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn kind_matches_serde_tag() {
        let ev = SessionEvent::ScenarioFinished {
            scenario: ScenarioKind::ExtremeWeather,
            outcome: ScenarioOutcome::Skipped("not implemented".into()),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], ev.kind());
        assert_eq!(v["outcome"]["status"], "skipped");
    }

    #[test]
    fn new_report_has_not_reached_outcome() {
        let r = SessionReport::new(ScenarioKind::HumanCrossing, "2024-01-01T00:00:00Z".into());
        assert_eq!(r.outcome, ScenarioOutcome::NotReached);
        assert!(r.last_phase().is_none());
        let s = serde_json::to_string(&r).unwrap();
        assert!(s.contains("\"scenario\":\"human-crossing\""));
    }
}
