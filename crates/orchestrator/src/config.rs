use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};
use std::path::Path;

use tor_core::{LaneChange, ScenarioKind, Signal, TrafficLightState, WeatherParameters};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub scenario: ScenarioKind,
    pub tm_port: u16,
    /// Leave the world in asynchronous mode and follow externally driven frames.
    pub asynchronous: bool,
    pub no_rendering: bool,
    pub fixed_delta_seconds: f64,
    /// Signal value that ends the watch loop.
    pub trigger: Signal,
    pub traffic: TrafficConfig,
    /// Light state rewrite applied while the ego waits at a light.
    pub light_gate: Option<LightGate>,
    pub population: PopulationConfig,
    pub maneuver: ManeuverConfig,
    pub weather: WeatherScenarioConfig,
    pub grace_period_s: f64,
    pub teardown_pause_s: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scenario: ScenarioKind::ExtremeWeather,
            tm_port: 8000,
            asynchronous: false,
            no_rendering: false,
            fixed_delta_seconds: 1.0 / 40.0,
            trigger: Signal::TakeoverRequested,
            traffic: TrafficConfig::default(),
            light_gate: Some(LightGate::default()),
            population: PopulationConfig::default(),
            maneuver: ManeuverConfig::default(),
            weather: WeatherScenarioConfig::default(),
            grace_period_s: 5.0,
            teardown_pause_s: 0.5,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: SessionConfig = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.fixed_delta_seconds > 0.0 && self.fixed_delta_seconds <= 0.1) {
            bail!("fixed_delta_seconds must be in (0, 0.1], got {}", self.fixed_delta_seconds);
        }
        let d = self.maneuver.heading_delta_deg.abs();
        if !(d > 0.0 && d < 90.0) {
            bail!("maneuver.heading_delta_deg must be in (0, 90), got {}", self.maneuver.heading_delta_deg);
        }
        if !(self.maneuver.min_speed_mps > 0.0) {
            bail!("maneuver.min_speed_mps must be positive");
        }
        if !(self.maneuver.max_duration_s > 0.0) {
            bail!("maneuver.max_duration_s must be positive");
        }
        for (name, v) in [
            ("grace_period_s", self.grace_period_s),
            ("teardown_pause_s", self.teardown_pause_s),
            ("weather.hold_s", self.weather.hold_s),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                bail!("{name} must be a non-negative number of seconds, got {v}");
            }
        }
        let running = self.population.running_fraction;
        if !(0.0..=1.0).contains(&running) {
            bail!("population.running_fraction must be within 0..=1, got {running}");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrafficConfig {
    pub leading_distance_m: f64,
    /// Negative values make autopilot vehicles faster than the speed limit.
    pub speed_difference_pct: f64,
    pub respawn_dormant: bool,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self { leading_distance_m: 2.5, speed_difference_pct: -300.0, respawn_dormant: false }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LightGate {
    pub from: TrafficLightState,
    pub to: TrafficLightState,
}

impl Default for LightGate {
    fn default() -> Self {
        Self { from: TrafficLightState::Red, to: TrafficLightState::Green }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PopulationConfig {
    pub vehicles: usize,
    pub walkers: usize,
    pub vehicle_filter: String,
    pub vehicle_generation: String,
    pub walker_filter: String,
    pub walker_generation: String,
    /// Seeds the population RNG and puts the traffic manager in deterministic mode.
    pub seed: Option<u64>,
    /// Pedestrian module seed; 0 leaves it untouched.
    pub walker_seed: u64,
    pub car_lights_on: bool,
    pub running_fraction: f64,
    pub crossing_factor: f32,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            vehicles: 50,
            walkers: 30,
            vehicle_filter: "vehicle.*".into(),
            vehicle_generation: "All".into(),
            walker_filter: "walker.pedestrian.*".into(),
            walker_generation: "2".into(),
            seed: None,
            walker_seed: 0,
            car_lights_on: false,
            running_fraction: 0.5,
            crossing_factor: 0.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManeuverConfig {
    /// Lane change performed right after the takeover request, if any.
    pub direction: Option<LaneChange>,
    pub heading_delta_deg: f64,
    pub min_speed_mps: f64,
    pub max_duration_s: f64,
}

impl Default for ManeuverConfig {
    fn default() -> Self {
        Self { direction: None, heading_delta_deg: 20.0, min_speed_mps: 0.5, max_duration_s: 10.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeatherScenarioConfig {
    pub profile: WeatherParameters,
    pub hold_s: f64,
}

impl Default for WeatherScenarioConfig {
    fn default() -> Self {
        Self { profile: WeatherParameters::extreme_fog(), hold_s: 10.0 }
    }
}
