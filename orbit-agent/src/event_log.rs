//! One-line JSON record per handled event: `{"ts": ..., "t": ..., "e": ...}`

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use orbit_core::event::OrbitEvent;

#[derive(Serialize)]
struct Record<'a> {
    ts: DateTime<Utc>,
    t: &'a str,
    e: Value,
}

pub struct EventLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl EventLog {
    pub fn stderr() -> Self {
        Self::with_writer(std::io::stderr())
    }

    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn record(&self, event: &OrbitEvent) {
        match event.payload.body() {
            Ok(body) => self.write(event.ts, event.type_name(), body),
            Err(e) => warn!(event = event.type_name(), error = %e, "failed to encode event"),
        }
    }

    /// Records an arbitrary payload under type name `t`
    pub fn record_value(&self, t: &str, payload: &impl Serialize) {
        match serde_json::to_value(payload) {
            Ok(body) => self.write(Utc::now(), t, body),
            Err(e) => warn!(event = t, error = %e, "failed to encode event"),
        }
    }

    fn write(&self, ts: DateTime<Utc>, t: &str, e: Value) {
        let line = match serde_json::to_string(&Record { ts, t, e }) {
            Ok(line) => line,
            Err(e) => {
                warn!(event = t, error = %e, "failed to encode event log line");
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(error = %e, "failed to write event log");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orbit_core::event::{DeploymentAction, DeploymentEvent};

    use super::*;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    #[test]
    fn test_records_envelope_per_line() {
        let buffer = Buffer::default();
        let log = EventLog::with_writer(buffer.clone());

        log.record(&OrbitEvent::deployment(DeploymentEvent {
            action: DeploymentAction::Restart,
            service: "web".into(),
            ..Default::default()
        }));
        log.record(&OrbitEvent::noop());
        log.record_value("PollFailed", &serde_json::json!({"error": "timeout"}));

        let lines = buffer.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["t"], "DeploymentEvent");
        assert_eq!(lines[0]["e"]["action"], "Restart");
        assert!(lines[0]["ts"].as_str().unwrap().ends_with('Z'));
        assert_eq!(lines[1]["t"], "NoopEvent");
        assert!(lines[1]["e"].is_null());
        assert_eq!(lines[2]["e"]["error"], "timeout");
    }
}
