//! Helper-process pipeline engine.
//!
//! Renders a template's stage graph to a launch line and runs it under a
//! launcher binary (e.g. `gst-launch-1.0` or a dedicated capture helper).
//! The helper reports status as line-delimited JSON on stdout — level
//! records are forwarded onto the engine bus as
//! [`EngineStatus::Level`] samples, and stdout closing is reported as
//! [`EngineStatus::Eos`] so the control plane can reap the instance.

use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;

use crossbeam_channel::Sender;

use crate::clock::ReferenceClock;
use crate::engine::{EngineEvent, EngineState, EngineStatus, PipelineEngine, PipelineHandle};
use crate::error::{Error, Result};
use crate::monitor::LevelSample;
use crate::template::PipelineTemplate;

/// Environment variable carrying the reference clock reading at spawn time,
/// letting the helper align its running time to the shared base.
pub const CLOCK_ENV: &str = "CRIBCAST_CLOCK_NS";

pub struct ProcessEngine {
    launcher: String,
}

impl ProcessEngine {
    pub fn new(launcher: &str) -> Self {
        Self {
            launcher: launcher.to_string(),
        }
    }
}

impl PipelineEngine for ProcessEngine {
    fn build(
        &self,
        instance_id: &str,
        template: &PipelineTemplate,
        clock: &ReferenceClock,
        bus: Sender<EngineEvent>,
    ) -> Result<Box<dyn PipelineHandle>> {
        let launch_line = template.launch_line();
        tracing::info!(
            template = template.name(),
            instance_id,
            %launch_line,
            "spawning pipeline helper"
        );

        let construction_error = |reason: String| Error::EngineConstruction {
            template: template.name().to_string(),
            reason,
        };

        let mut child = Command::new(&self.launcher)
            .args(launch_line.split_whitespace())
            .env(CLOCK_ENV, clock.now_ns().to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| construction_error(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| construction_error("helper stdout not captured".to_string()))?;

        spawn_status_reader(instance_id.to_string(), stdout, bus.clone());

        Ok(Box::new(ProcessPipeline {
            instance: instance_id.to_string(),
            child,
            bus,
        }))
    }
}

/// Reads the helper's stdout until EOF, forwarding level records.
fn spawn_status_reader(instance: String, stdout: ChildStdout, bus: Sender<EngineEvent>) {
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<LevelSample>(trimmed) {
                Ok(sample) => {
                    let _ = bus.send(EngineEvent {
                        instance: instance.clone(),
                        status: EngineStatus::Level(sample),
                    });
                }
                Err(_) => {
                    tracing::trace!(instance = %instance, line = trimmed, "helper output");
                }
            }
        }
        // Live sources never end on their own; the control plane decides
        // whether this Eos is an expected teardown or a fault.
        let _ = bus.send(EngineEvent {
            instance: instance.clone(),
            status: EngineStatus::Eos,
        });
        tracing::debug!(instance = %instance, "helper stdout closed");
    });
}

struct ProcessPipeline {
    instance: String,
    child: Child,
    bus: Sender<EngineEvent>,
}

impl ProcessPipeline {
    fn post(&self, state: EngineState) {
        let _ = self.bus.send(EngineEvent {
            instance: self.instance.clone(),
            status: EngineStatus::StateChanged(state),
        });
    }

    fn kill_child(&mut self) {
        // Already-exited children report InvalidInput; that is fine.
        if let Err(e) = self.child.kill() {
            tracing::debug!(instance = %self.instance, error = %e, "kill");
        }
        let _ = self.child.wait();
    }
}

impl PipelineHandle for ProcessPipeline {
    fn play(&mut self) -> Result<()> {
        // The helper starts producing as soon as it is spawned.
        self.post(EngineState::Running);
        Ok(())
    }

    /// A helper process has no resumable pause; suspend maps to teardown.
    fn pause(&mut self) -> Result<()> {
        tracing::debug!(instance = %self.instance, "pause requested, stopping helper");
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        self.kill_child();
        self.post(EngineState::Stopped);
        Ok(())
    }
}

impl Drop for ProcessPipeline {
    fn drop(&mut self) {
        self.kill_child();
    }
}
