use anyhow::Result;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use iox::EventLogWriter;
use tor_orchestrator::EventRx;

/// Drains session events into the event log on its own thread until the
/// session drops its sender. Returns the number of records written.
pub fn spawn(path: PathBuf, rx: EventRx) -> Result<JoinHandle<Result<usize>>> {
    let handle = thread::Builder::new()
        .name("event-recorder".into())
        .spawn(move || {
            let mut writer = EventLogWriter::create(&path)?;
            let mut written = 0usize;
            for rec in rx.iter() {
                if let Err(e) = writer.append(&rec) {
                    error!(path = %path.display(), error = %e, "event log write failed, recording stopped");
                    return Err(e);
                }
                written += 1;
            }
            debug!(written, "event recorder finished");
            Ok(written)
        })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{EventRecord, SessionEvent};

    #[test]
    fn records_until_sender_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let (tx, rx) = tor_orchestrator::event_channel();
        let handle = spawn(path.clone(), rx).unwrap();
        for seq in 0..3 {
            tx.send(EventRecord { seq, frame: seq * 2, sim_time_s: 0.05 * seq as f64, event: SessionEvent::SignalWritten { value: 0 } })
                .unwrap();
        }
        drop(tx);
        assert_eq!(handle.join().unwrap().unwrap(), 3);
        let back = iox::import_ndjson(&path).unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[2].frame, 4);
    }
}
