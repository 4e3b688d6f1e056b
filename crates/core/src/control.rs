//! Single-threaded control loop.
//!
//! Every callback that touches shared state — viewer connects and
//! disconnects, level samples, engine status, the periodic sweep — is a
//! typed [`ControlEvent`] consumed serially by one dispatch loop. No two
//! handlers ever run concurrently, so the mount/session/profile tables need
//! no cross-handler locking; in exchange every handler must return quickly.
//! The only blocking work in the process happens inside the engine's own
//! worker contexts, which talk back exclusively through the bus.
//!
//! [`ControlPlane`] is an explicitly constructed context object owning the
//! clock, registries, selector and emitter. Tests build as many independent
//! instances as they like and inject synthetic events.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::clock::ReferenceClock;
use crate::engine::{EngineEvent, EngineStatus, PipelineEngine, PipelineHandle};
use crate::error::Result;
use crate::events::{Event, EventEmitter};
use crate::monitor::{DEFAULT_WINDOW_LEN, LevelMonitor, LevelSample, SIGNIFICANCE_THRESHOLD};
use crate::mount::{DetachOutcome, MountRegistry};
use crate::profile::{Profile, ProfileSelector, ProfileTrigger};
use crate::session::{DEFAULT_SESSION_TIMEOUT, SessionTable, ViewerSession};
use crate::template::TemplateRegistry;

/// Typed control-plane callback.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Transport reported a new viewer for a mount path.
    ClientConnect { path: String, ip: IpAddr },
    /// Transport reported a viewer going away. Idempotent.
    ClientDisconnect { session_id: String },
    /// Keepalive/activity for a session, deferring the sweep.
    Activity { session_id: String },
    /// Operator or schedule requests a profile.
    SetProfile(Profile),
    /// Asynchronous engine status.
    Engine(EngineEvent),
    /// Periodic session sweep (normally driven by the internal ticker).
    Sweep,
    /// Stop the loop, tearing down all instances.
    Shutdown,
}

/// Tunables for the control loop.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub sweep_interval: Duration,
    pub session_timeout: Duration,
    /// Minimum dwell between profile transitions.
    pub profile_dwell: Duration,
    pub initial_profile: Profile,
    pub trigger: ProfileTrigger,
    /// Normalized RMS below which level samples are not emitted.
    pub level_threshold: f64,
    /// Rolling window length for the ambient judgment.
    pub level_window: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(2),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            profile_dwell: Duration::from_secs(5),
            initial_profile: Profile::Day,
            trigger: ProfileTrigger::Operator,
            level_threshold: SIGNIFICANCE_THRESHOLD,
            level_window: DEFAULT_WINDOW_LEN,
        }
    }
}

/// The control plane: owns every registry and dispatches all callbacks.
pub struct ControlPlane {
    clock: ReferenceClock,
    templates: TemplateRegistry,
    mounts: MountRegistry,
    sessions: SessionTable,
    selector: ProfileSelector,
    level: LevelMonitor,
    emitter: EventEmitter,
    config: ControlConfig,
    control_tx: Sender<ControlEvent>,
    control_rx: Receiver<ControlEvent>,
    engine_tx: Sender<EngineEvent>,
    engine_rx: Receiver<EngineEvent>,
    /// The always-on level-monitoring pipeline, outside any mount.
    level_pipeline: Option<(String, Box<dyn PipelineHandle>)>,
}

impl ControlPlane {
    pub fn new(
        engine: Arc<dyn PipelineEngine>,
        emitter: EventEmitter,
        config: ControlConfig,
    ) -> Self {
        let (control_tx, control_rx) = unbounded();
        let (engine_tx, engine_rx) = unbounded();
        let clock = ReferenceClock::new();
        let templates = TemplateRegistry::new(engine);
        let mounts = MountRegistry::new(templates.clone(), clock.clone(), engine_tx.clone());
        let selector = ProfileSelector::new(
            config.initial_profile,
            config.trigger,
            config.profile_dwell,
        );
        let level = LevelMonitor::new(config.level_threshold, config.level_window);

        Self {
            clock,
            templates,
            mounts,
            sessions: SessionTable::new(),
            selector,
            level,
            emitter,
            config,
            control_tx,
            control_rx,
            engine_tx,
            engine_rx,
            level_pipeline: None,
        }
    }

    pub fn clock(&self) -> &ReferenceClock {
        &self.clock
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn profile(&self) -> Profile {
        self.selector.profile()
    }

    /// Sender used by transport adapters (and tests) to inject events.
    pub fn sender(&self) -> Sender<ControlEvent> {
        self.control_tx.clone()
    }

    /// Start the always-on level-monitoring pipeline from a registered
    /// template. Fatal at startup when the capture device is absent.
    pub fn start_monitor(&mut self, template_name: &str) -> Result<()> {
        let id = format!("monitor-{template_name}");
        let mut handle =
            self.templates
                .instantiate(template_name, &self.clock, &id, self.engine_tx.clone())?;
        handle.play()?;
        tracing::info!(template = template_name, instance_id = %id, "level monitor running");
        self.level_pipeline = Some((id, handle));
        Ok(())
    }

    /// Run the dispatch loop until a [`ControlEvent::Shutdown`] arrives.
    pub fn run(&mut self) {
        let control_rx = self.control_rx.clone();
        let engine_rx = self.engine_rx.clone();
        let ticker = crossbeam_channel::tick(self.config.sweep_interval);

        tracing::info!(profile = %self.selector.profile(), "control loop running");

        loop {
            crossbeam_channel::select! {
                recv(control_rx) -> event => match event {
                    Ok(event) => {
                        if !self.dispatch(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(engine_rx) -> event => match event {
                    Ok(event) => self.on_engine_event(event),
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.sweep(),
            }
        }

        self.shutdown();
    }

    /// Apply one event. Returns `false` when the loop should stop.
    pub fn dispatch(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::ClientConnect { path, ip } => {
                if let Err(e) = self.client_connect(&path, ip) {
                    tracing::warn!(path, %ip, error = %e, "attach failed");
                }
            }
            ControlEvent::ClientDisconnect { session_id } => {
                self.client_disconnect(&session_id);
            }
            ControlEvent::Activity { session_id } => {
                self.sessions.touch(&session_id);
            }
            ControlEvent::SetProfile(target) => self.set_profile(target),
            ControlEvent::Engine(event) => self.on_engine_event(event),
            ControlEvent::Sweep => self.sweep(),
            ControlEvent::Shutdown => return false,
        }
        true
    }

    /// Attach a viewer: resolve the mount under the current profile, then
    /// register and report the session.
    pub fn client_connect(&mut self, path: &str, ip: IpAddr) -> Result<Arc<ViewerSession>> {
        let outcome = self.mounts.resolve(path, self.selector.profile())?;
        let session = self.sessions.create(path, ip, &outcome.instance_id);
        self.emitter.emit(&Event::ClientConnected { ip: ip.to_string() });
        if outcome.created && outcome.video {
            self.emitter.emit(&Event::VideoStarted);
        }
        Ok(session)
    }

    /// Detach a viewer. Double-disconnect is a no-op, not an error.
    pub fn client_disconnect(&mut self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            tracing::debug!(session_id, "disconnect for unknown session ignored");
            return;
        };
        self.finish_disconnect(&session);
    }

    fn finish_disconnect(&mut self, session: &ViewerSession) {
        self.emitter.emit(&Event::ClientDisconnected {
            ip: session.ip.to_string(),
        });
        if self.mounts.detach(&session.mount_path, &session.instance_id) == DetachOutcome::Removed {
            self.emitter.emit(&Event::StreamRemoved);
        }
    }

    /// Reclaim sessions with no activity inside the timeout window.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
    }

    pub fn sweep_at(&mut self, now: Instant) {
        let timeout = self.config.session_timeout;
        for session in self.sessions.sweep(now, timeout) {
            tracing::info!(session_id = %session.id, ip = %session.ip, "session expired");
            self.finish_disconnect(&session);
        }
    }

    /// Operator/schedule profile command.
    pub fn set_profile(&mut self, target: Profile) {
        if let Some((from, to)) = self.selector.on_operator(target, Instant::now()) {
            self.apply_transition(from, to);
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event.status {
            EngineStatus::Level(sample) => self.on_level(sample),
            EngineStatus::StateChanged(state) => {
                self.mounts.note_state(&event.instance, state);
            }
            EngineStatus::Error(reason) => {
                tracing::error!(instance = %event.instance, reason, "pipeline error");
                self.reap_instance(&event.instance);
            }
            EngineStatus::Eos => {
                // Live sources never legitimately end; any Eos for a still
                // registered instance is a fault.
                self.reap_instance(&event.instance);
            }
        }
    }

    /// Handle one loudness measurement from the monitor pipeline.
    pub fn on_level(&mut self, sample: LevelSample) {
        if let Some(significant) = self.level.observe(sample) {
            self.emitter.emit_level(&significant);
        }
        let ambient = self.level.ambient();
        if let Some((from, to)) = self.selector.on_ambient(ambient, Instant::now()) {
            self.apply_transition(from, to);
        }
    }

    fn apply_transition(&mut self, from: Profile, to: Profile) {
        self.emitter.emit(&Event::ProfileChanged { from, to });
        for _removed in self.mounts.reassign(from, to) {
            self.emitter.emit(&Event::StreamRemoved);
        }
    }

    fn reap_instance(&mut self, instance_id: &str) {
        if self
            .level_pipeline
            .as_ref()
            .is_some_and(|(id, _)| id == instance_id)
        {
            tracing::error!(instance_id, "level monitor pipeline died");
            self.level_pipeline = None;
            return;
        }

        for session in self.sessions.remove_by_instance(instance_id) {
            self.emitter.emit(&Event::ClientDisconnected {
                ip: session.ip.to_string(),
            });
        }
        if self.mounts.remove_instance(instance_id).is_some() {
            self.emitter.emit(&Event::StreamRemoved);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("control loop stopping");
        if let Some((id, mut handle)) = self.level_pipeline.take() {
            if let Err(e) = handle.stop() {
                tracing::warn!(instance_id = %id, error = %e, "monitor stop failed");
            }
        }
        self.mounts.shutdown();
    }
}
