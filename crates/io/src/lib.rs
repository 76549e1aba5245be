use anyhow::{Context, Result};
use std::{fs::{self, File}, io::{BufRead, BufWriter, Write}, path::{Path, PathBuf}};
use serde::{Serialize, Deserialize};
use tracing::debug;

use model::*;
use tor_core::{Signal, SignalChannel, TorError};

/// File-backed signal channel. The file holds one decimal integer; writes
/// truncate and rewrite it, reads parse the whole (trimmed) contents.
#[derive(Debug, Clone)]
pub struct SignalFile {
    path: PathBuf,
}

impl SignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    /// Raw integer stored in the file, without domain validation.
    pub fn read_raw(&self) -> Result<i64, TorError> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| TorError::ChannelUnavailable(format!("open {}: {e}", self.path.display())))?;
        text.trim().parse::<i64>()
            .map_err(|e| TorError::ChannelUnavailable(format!("parse {:?} in {}: {e}", text.trim(), self.path.display())))
    }
}

impl SignalChannel for SignalFile {
    fn write(&self, signal: Signal) -> Result<(), TorError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .map_err(|e| TorError::ChannelUnavailable(format!("create {}: {e}", dir.display())))?;
        }
        fs::write(&self.path, signal.value().to_string())
            .map_err(|e| TorError::ChannelUnavailable(format!("write {}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), value = signal.value(), "signal written");
        Ok(())
    }

    fn read(&self) -> Result<Signal, TorError> {
        let raw = self.read_raw()?;
        Signal::try_from(raw).map_err(|e| TorError::ChannelUnavailable(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Ndjson,
    Csv,
}

impl LogFormat {
    /// `.csv` selects CSV, anything else NDJSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => LogFormat::Csv,
            _ => LogFormat::Ndjson,
        }
    }
}

/// Incremental event log; every record is flushed so an aborted session
/// still leaves a readable file.
pub enum EventLogWriter {
    Ndjson(BufWriter<File>),
    Csv(csv::Writer<File>),
}

impl EventLogWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        Ok(match LogFormat::from_path(path) {
            LogFormat::Ndjson => EventLogWriter::Ndjson(BufWriter::new(f)),
            LogFormat::Csv => EventLogWriter::Csv(csv::Writer::from_writer(f)),
        })
    }

    pub fn append(&mut self, rec: &EventRecord) -> Result<()> {
        match self {
            EventLogWriter::Ndjson(w) => {
                let s = serde_json::to_string(rec)?;
                writeln!(w, "{}", s)?;
                w.flush()?;
            }
            EventLogWriter::Csv(w) => {
                w.serialize(CsvRow::from_record(rec)?)?;
                w.flush()?;
            }
        }
        Ok(())
    }
}

pub fn export_ndjson(records: &[EventRecord], path: &Path) -> Result<()> {
    let f = File::create(path)?;
    let mut w = BufWriter::new(f);
    for r in records {
        let s = serde_json::to_string(r)?;
        writeln!(w, "{}", s)?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_ndjson(path: &Path) -> Result<Vec<EventRecord>> {
    let f = File::open(path)?;
    let rdr = std::io::BufReader::new(f);
    let mut records = vec![];
    for line in rdr.lines() {
        let s = line?;
        if s.trim().is_empty() { continue; }
        let r: EventRecord = serde_json::from_str(&s)?;
        records.push(r);
    }
    Ok(records)
}

pub fn export_csv(records: &[EventRecord], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    for r in records {
        w.serialize(CsvRow::from_record(r)?)?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_csv(path: &Path) -> Result<Vec<EventRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in rdr.deserialize() {
        let r: CsvRow = row?;
        let event: SessionEvent = serde_json::from_str(&r.detail)
            .with_context(|| format!("event #{} detail", r.seq))?;
        records.push(EventRecord { seq: r.seq, frame: r.frame, sim_time_s: r.sim_time_s, event });
    }
    Ok(records)
}

pub fn write_report(report: &SessionReport, path: &Path) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    serde_json::to_writer_pretty(&mut w, report)?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

pub fn read_report(path: &Path) -> Result<SessionReport> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(serde_json::from_reader(std::io::BufReader::new(f))?)
}

#[derive(Serialize, Deserialize)]
struct CsvRow {
    seq: u64,
    frame: u64,
    sim_time_s: f64,
    event: String,
    detail: String,
}

impl CsvRow {
    fn from_record(r: &EventRecord) -> Result<Self> {
        Ok(Self {
            seq: r.seq,
            frame: r.frame,
            sim_time_s: r.sim_time_s,
            event: r.event.kind().to_string(),
            detail: serde_json::to_string(&r.event)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tor_core::{ScenarioKind, WeatherParameters};

    fn sample_records() -> Vec<EventRecord> {
        vec![
            EventRecord { seq: 0, frame: 0, sim_time_s: 0.0, event: SessionEvent::PhaseChanged { phase: Phase::Setup } },
            EventRecord { seq: 1, frame: 40, sim_time_s: 1.0, event: SessionEvent::TakeoverObserved { value: 2 } },
            EventRecord {
                seq: 2,
                frame: 41,
                sim_time_s: 1.025,
                event: SessionEvent::WeatherApplied { weather: WeatherParameters::extreme_fog() },
            },
            EventRecord {
                seq: 3,
                frame: 441,
                sim_time_s: 11.025,
                event: SessionEvent::ScenarioFinished {
                    scenario: ScenarioKind::ExtremeWeather,
                    outcome: ScenarioOutcome::Completed,
                },
            },
        ]
    }

    #[test]
    fn signal_file_round_trip() {
        let dir = tempdir().unwrap();
        let ch = SignalFile::new(dir.path().join("SignalFile.txt"));
        for s in [Signal::Idle, Signal::Reserved, Signal::TakeoverRequested] {
            ch.write(s).unwrap();
            assert_eq!(ch.read().unwrap(), s);
        }
    }

    #[test]
    fn signal_write_truncates_previous_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sig.txt");
        fs::write(&path, "123456").unwrap();
        let ch = SignalFile::new(&path);
        ch.write(Signal::Reserved).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn signal_write_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let ch = SignalFile::new(dir.path().join("ConfigFiles").join("SignalFile.txt"));
        ch.write(Signal::Idle).unwrap();
        assert_eq!(ch.read().unwrap(), Signal::Idle);
    }

    #[test]
    fn signal_read_tolerates_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sig.txt");
        fs::write(&path, "2\r\n").unwrap();
        assert_eq!(SignalFile::new(&path).read().unwrap(), Signal::TakeoverRequested);
    }

    #[test]
    fn missing_or_corrupt_signal_is_channel_unavailable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sig.txt");
        let ch = SignalFile::new(&path);
        assert!(matches!(ch.read(), Err(TorError::ChannelUnavailable(_))));
        fs::write(&path, "two").unwrap();
        assert!(matches!(ch.read(), Err(TorError::ChannelUnavailable(_))));
        fs::write(&path, "7").unwrap();
        assert_eq!(ch.read_raw().unwrap(), 7);
        assert!(matches!(ch.read(), Err(TorError::ChannelUnavailable(_))));
    }

    #[test]
    fn ndjson_export_import() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let recs = sample_records();
        export_ndjson(&recs, &path).unwrap();
        assert_eq!(import_ndjson(&path).unwrap(), recs);
    }

    #[test]
    fn csv_export_import() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.csv");
        let recs = sample_records();
        export_csv(&recs, &path).unwrap();
        assert_eq!(import_csv(&path).unwrap(), recs);
    }

    #[test]
    fn csv_writer_produces_one_row_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.csv");
        let recs = sample_records();
        {
            let mut w = EventLogWriter::create(&path).unwrap();
            assert!(matches!(w, EventLogWriter::Csv(_)));
            for r in &recs {
                w.append(r).unwrap();
            }
        }
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), recs.len() + 1);
        assert!(text.lines().next().unwrap().starts_with("seq,frame,sim_time_s,event,detail"));
        let back = import_csv(&path).unwrap();
        assert_eq!(back.len(), recs.len());
        assert_eq!(back[1].event, SessionEvent::TakeoverObserved { value: 2 });
    }

    #[test]
    fn report_json_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = SessionReport::new(ScenarioKind::ExtremeWeather, "2024-05-01T10:00:00Z".into());
        report.trigger_frame = Some(40);
        report.outcome = ScenarioOutcome::Completed;
        write_report(&report, &path).unwrap();
        assert_eq!(read_report(&path).unwrap(), report);
    }

    #[test]
    fn log_format_from_extension() {
        assert_eq!(LogFormat::from_path(Path::new("a/b.CSV")), LogFormat::Csv);
        assert_eq!(LogFormat::from_path(Path::new("a/b.ndjson")), LogFormat::Ndjson);
        assert_eq!(LogFormat::from_path(Path::new("events")), LogFormat::Ndjson);
    }
}
