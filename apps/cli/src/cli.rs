use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use tor_core::{LaneChange, ScenarioKind};
use tor_orchestrator::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "tor-runner")]
#[command(about = "Run a take-over request scenario: spawn traffic, wait for the operator's signal, hand control over")]
pub struct Cli {
    /// IP of the simulation server
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// TCP port of the simulation server
    #[arg(short, long, default_value_t = 2000)]
    pub port: u16,

    /// Seconds to wait for the server before giving up
    #[arg(long, default_value_t = 10.0)]
    pub timeout: f64,

    /// Number of vehicles [default: 50]
    #[arg(short = 'n', long = "number-of-vehicles")]
    pub vehicles: Option<usize>,

    /// Number of walkers [default: 30]
    #[arg(short = 'w', long = "number-of-walkers")]
    pub walkers: Option<usize>,

    /// Vehicle blueprint filter [default: vehicle.*]
    #[arg(long, value_name = "PATTERN")]
    pub filterv: Option<String>,

    /// Vehicle generation: 1, 2 or All [default: All]
    #[arg(long, value_name = "G")]
    pub generationv: Option<String>,

    /// Pedestrian blueprint filter [default: walker.pedestrian.*]
    #[arg(long, value_name = "PATTERN")]
    pub filterw: Option<String>,

    /// Pedestrian generation: 1, 2 or All [default: 2]
    #[arg(long, value_name = "G")]
    pub generationw: Option<String>,

    /// Traffic manager port [default: 8000]
    #[arg(long)]
    pub tm_port: Option<u16>,

    /// Follow frames driven by another client instead of ticking
    #[arg(long)]
    pub asynch: bool,

    /// Random seed; also puts the traffic manager in deterministic mode
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Seed for the pedestrians module
    #[arg(long)]
    pub seedw: Option<u64>,

    /// Let the traffic manager drive vehicle lights
    #[arg(long)]
    pub car_lights_on: bool,

    /// Respawn dormant vehicles (large maps)
    #[arg(long)]
    pub respawn: bool,

    #[arg(long)]
    pub no_rendering: bool,

    /// 1/lvad, 2/ew, 3/csa, 4/hcr or the kebab-case name [default: extreme-weather]
    #[arg(long)]
    pub tor_scenario: Option<ScenarioKind>,

    /// Lane change right after the takeover request (left or right)
    #[arg(long)]
    pub lane_change: Option<LaneChange>,

    /// File shared with the operator task
    #[arg(long)]
    pub signal_file: Option<PathBuf>,

    /// JSON session config; flags given on the command line win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the session report (JSON) here
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Record session events; .csv for CSV, anything else NDJSON
    #[arg(long)]
    pub event_log: Option<PathBuf>,

    /// Pace the offline world at wall-clock speed
    #[arg(long)]
    pub realtime: bool,
}

impl Cli {
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut cfg = match &self.config {
            Some(path) => SessionConfig::from_json_file(path)?,
            None => SessionConfig::default(),
        };
        let pop = &mut cfg.population;
        if let Some(n) = self.vehicles { pop.vehicles = n; }
        if let Some(n) = self.walkers { pop.walkers = n; }
        if let Some(f) = &self.filterv { pop.vehicle_filter = f.clone(); }
        if let Some(g) = &self.generationv { pop.vehicle_generation = g.clone(); }
        if let Some(f) = &self.filterw { pop.walker_filter = f.clone(); }
        if let Some(g) = &self.generationw { pop.walker_generation = g.clone(); }
        if self.seed.is_some() { pop.seed = self.seed; }
        if let Some(s) = self.seedw { pop.walker_seed = s; }
        if self.car_lights_on { pop.car_lights_on = true; }

        if let Some(port) = self.tm_port { cfg.tm_port = port; }
        if self.asynch { cfg.asynchronous = true; }
        if self.respawn { cfg.traffic.respawn_dormant = true; }
        if self.no_rendering { cfg.no_rendering = true; }
        if let Some(kind) = self.tor_scenario { cfg.scenario = kind; }
        if let Some(dir) = self.lane_change { cfg.maneuver.direction = Some(dir); }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn signal_path(&self) -> PathBuf {
        match &self.signal_file {
            Some(p) => p.clone(),
            None => default_signal_path(),
        }
    }
}

pub fn default_signal_path() -> PathBuf {
    let base = dirs_next::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("tor-runner").join("SignalFile.txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tor-runner").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_session_defaults() {
        let cli = parse(&[]);
        assert_eq!(cli.port, 2000);
        assert_eq!(cli.session_config().unwrap(), SessionConfig::default());
        assert!(cli.signal_path().ends_with("tor-runner/SignalFile.txt"));
    }

    #[test]
    fn scenario_accepts_number_code_and_name() {
        for (arg, kind) in [
            ("1", ScenarioKind::LeadVehicleDeceleration),
            ("ew", ScenarioKind::ExtremeWeather),
            ("construction-site", ScenarioKind::ConstructionSite),
            ("HCR", ScenarioKind::HumanCrossing),
        ] {
            let cfg = parse(&["--tor-scenario", arg]).session_config().unwrap();
            assert_eq!(cfg.scenario, kind);
        }
        assert!(Cli::try_parse_from(["tor-runner", "--tor-scenario", "9"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tor.json");
        std::fs::write(&path, r#"{"tm_port": 9000, "population": {"vehicles": 5, "walkers": 7}}"#).unwrap();
        let cli = parse(&[
            "--config", path.to_str().unwrap(),
            "-n", "12",
            "--asynch",
            "--seed", "4",
            "--lane-change", "right",
            "--generationw", "1",
        ]);
        let cfg = cli.session_config().unwrap();
        assert_eq!(cfg.tm_port, 9000);
        assert_eq!(cfg.population.vehicles, 12);
        assert_eq!(cfg.population.walkers, 7);
        assert_eq!(cfg.population.seed, Some(4));
        assert_eq!(cfg.population.walker_generation, "1");
        assert!(cfg.asynchronous);
        assert_eq!(cfg.maneuver.direction, Some(LaneChange::Right));
    }
}
