//! Structured event emission.
//!
//! Every lifecycle transition is reported as one self-contained JSON object
//! per line on the observability sink (stdout in production). The stream is
//! append-only and best-effort: a failed write is logged locally and never
//! affects pipeline operation. No ordering is guaranteed between events
//! from different components beyond each component's own emission order.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::monitor::LevelSample;
use crate::profile::Profile;

/// Lifecycle and telemetry event kinds.
///
/// Serialized with an `action` discriminator, e.g.
/// `{"action":"client-connected","ip":"10.0.0.1"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Event {
    ClientConnected { ip: String },
    ClientDisconnected { ip: String },
    StreamRemoved,
    VideoStarted,
    ProfileChanged { from: Profile, to: Profile },
}

/// Line-delimited JSON emitter over an injected sink.
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl EventEmitter {
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Append one lifecycle event record.
    pub fn emit(&self, event: &Event) {
        self.write_record(event);
    }

    /// Append one level-sample record.
    ///
    /// Level records carry no `action` field; they are bare measurement
    /// objects: `{"rms":-20.0,"peak":-10.0,"decay":-15.0,"normrms":0.1}`.
    pub fn emit_level(&self, sample: &LevelSample) {
        self.write_record(sample);
    }

    fn write_record<T: Serialize>(&self, record: &T) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "event serialization failed");
                return;
            }
        };
        let mut sink = self.sink.lock();
        if let Err(e) = writeln!(sink, "{line}") {
            tracing::warn!(error = %e, "event write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inspectable sink shared between the emitter and the test.
    #[derive(Clone, Default)]
    struct BufferSink(Arc<Mutex<Vec<u8>>>);

    impl Write for BufferSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(sink: &BufferSink) -> Vec<String> {
        String::from_utf8(sink.0.lock().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn events_serialize_with_action_tag() {
        let sink = BufferSink::default();
        let emitter = EventEmitter::with_sink(Box::new(sink.clone()));

        emitter.emit(&Event::ClientConnected {
            ip: "10.0.0.1".to_string(),
        });
        emitter.emit(&Event::StreamRemoved);
        emitter.emit(&Event::ProfileChanged {
            from: Profile::Day,
            to: Profile::Night,
        });

        let lines = lines(&sink);
        assert_eq!(
            lines[0],
            r#"{"action":"client-connected","ip":"10.0.0.1"}"#
        );
        assert_eq!(lines[1], r#"{"action":"stream-removed"}"#);
        assert_eq!(
            lines[2],
            r#"{"action":"profile-changed","from":"Day","to":"Night"}"#
        );
    }

    #[test]
    fn level_records_are_bare_measurements() {
        let sink = BufferSink::default();
        let emitter = EventEmitter::with_sink(Box::new(sink.clone()));
        emitter.emit_level(&LevelSample::from_db(-20.0, -10.0, -15.0));

        let lines = lines(&sink);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(value.get("action").is_none());
        assert!((value["normrms"].as_f64().unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(value["rms"].as_f64().unwrap(), -20.0);
    }

    #[test]
    fn failed_writes_are_swallowed() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let emitter = EventEmitter::with_sink(Box::new(FailingSink));
        // Must not panic or propagate.
        emitter.emit(&Event::VideoStarted);
    }
}
