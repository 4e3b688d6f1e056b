//! Pipeline templates and the template registry.
//!
//! A [`PipelineTemplate`] is an immutable, named description of a
//! capture/encode topology: an ordered list of [`StageDescriptor`]s plus a
//! suspend policy and sharing mode. Templates are defined at startup,
//! validated as they are built, and read-only for the life of the process.
//! [`TemplateRegistry`] stores them and turns them into running pipelines
//! through the [`PipelineEngine`](crate::engine::PipelineEngine), stamping
//! every instance with the server's [`ReferenceClock`] — the clock handle is
//! a required parameter, so an unstamped pipeline cannot be constructed.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;

use crate::clock::ReferenceClock;
use crate::engine::{EngineEvent, PipelineEngine, PipelineHandle};
use crate::error::{Error, Result};

/// What happens to a pipeline instance when its last viewer detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    /// Keep the pipeline running with zero viewers.
    AlwaysRun,
    /// Drain and tear the instance down once idle.
    SuspendWhenIdle,
}

/// One stage of a pipeline topology: an element (or caps filter) name plus
/// its properties. Opaque to the control plane, interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    element: String,
    properties: Vec<(String, String)>,
}

impl StageDescriptor {
    pub fn new(element: &str) -> Result<Self> {
        if element.trim().is_empty() {
            return Err(Error::Configuration("empty stage element".to_string()));
        }
        Ok(Self {
            element: element.to_string(),
            properties: Vec::new(),
        })
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.push((name.to_string(), value.to_string()));
        self
    }

    pub fn element(&self) -> &str {
        &self.element
    }

    /// Render this stage as a launch-line fragment: `element key=value ...`.
    pub fn launch_fragment(&self) -> String {
        let mut out = self.element.clone();
        for (name, value) in &self.properties {
            out.push(' ');
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

/// Immutable named capture/encode topology.
#[derive(Debug, Clone)]
pub struct PipelineTemplate {
    name: String,
    stages: Vec<StageDescriptor>,
    suspend: SuspendPolicy,
    shared: bool,
    device: Option<String>,
    video: bool,
}

impl PipelineTemplate {
    /// Build a template. Fails fast with a configuration error on an empty
    /// name or stage list rather than letting the engine discover it later.
    pub fn new(name: &str, stages: Vec<StageDescriptor>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Configuration("empty template name".to_string()));
        }
        if stages.is_empty() {
            return Err(Error::Configuration(format!(
                "template {name} has no stages"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            stages,
            suspend: SuspendPolicy::AlwaysRun,
            shared: true,
            device: None,
            video: false,
        })
    }

    pub fn suspend_policy(mut self, suspend: SuspendPolicy) -> Self {
        self.suspend = suspend;
        self
    }

    /// One pipeline instance per connecting viewer instead of a shared one.
    pub fn per_viewer(mut self) -> Self {
        self.shared = false;
        self
    }

    /// Claim exclusive ownership of a capture device. The registry refuses
    /// a second live instantiation against the same device.
    pub fn exclusive_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Mark the template as carrying a video track.
    pub fn with_video(mut self) -> Self {
        self.video = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn suspend(&self) -> SuspendPolicy {
        self.suspend
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn has_video(&self) -> bool {
        self.video
    }

    /// Render the whole topology as a `!`-separated launch line.
    pub fn launch_line(&self) -> String {
        self.stages
            .iter()
            .map(StageDescriptor::launch_fragment)
            .collect::<Vec<_>>()
            .join(" ! ")
    }
}

/// Registry of named templates, plus the exclusive-device claim table.
///
/// All device/codec fallibility is isolated behind [`instantiate`]
/// (Self::instantiate): a missing capture device or unbuildable stage graph
/// surfaces there and nowhere else.
#[derive(Clone)]
pub struct TemplateRegistry {
    engine: Arc<dyn PipelineEngine>,
    templates: Arc<RwLock<HashMap<String, Arc<PipelineTemplate>>>>,
    /// device -> instance id currently holding it.
    claims: Arc<RwLock<HashMap<String, String>>>,
}

impl TemplateRegistry {
    pub fn new(engine: Arc<dyn PipelineEngine>) -> Self {
        Self {
            engine,
            templates: Arc::new(RwLock::new(HashMap::new())),
            claims: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a template. Names are unique for the life of the process.
    pub fn register(&self, template: PipelineTemplate) -> Result<()> {
        let mut templates = self.templates.write();
        if templates.contains_key(template.name()) {
            return Err(Error::DuplicateTemplate(template.name().to_string()));
        }
        tracing::info!(template = template.name(), "template registered");
        templates.insert(template.name().to_string(), Arc::new(template));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineTemplate>> {
        self.templates.read().get(name).cloned()
    }

    /// Realize a template as a running pipeline stamped with `clock`.
    ///
    /// Engine status for the new pipeline is posted to `bus` tagged with
    /// `instance_id`. Fails with [`Error::UnknownTemplate`],
    /// [`Error::DeviceUnavailable`] or [`Error::EngineConstruction`].
    pub fn instantiate(
        &self,
        name: &str,
        clock: &ReferenceClock,
        instance_id: &str,
        bus: Sender<EngineEvent>,
    ) -> Result<Box<dyn PipelineHandle>> {
        let template = self
            .get(name)
            .ok_or_else(|| Error::UnknownTemplate(name.to_string()))?;

        if let Some(device) = template.device() {
            let mut claims = self.claims.write();
            if let Some(held_by) = claims.get(device) {
                return Err(Error::DeviceUnavailable {
                    device: device.to_string(),
                    held_by: held_by.clone(),
                });
            }
            claims.insert(device.to_string(), instance_id.to_string());
        }

        match self.engine.build(instance_id, &template, clock, bus) {
            Ok(handle) => {
                tracing::debug!(template = name, instance_id, "pipeline instantiated");
                Ok(handle)
            }
            Err(e) => {
                self.release(instance_id);
                Err(e)
            }
        }
    }

    /// Release any device claims held by an instance (called when it stops
    /// or enters draining).
    pub fn release(&self, instance_id: &str) {
        let mut claims = self.claims.write();
        claims.retain(|device, holder| {
            if holder == instance_id {
                tracing::debug!(device, instance_id, "device claim released");
                false
            } else {
                true
            }
        });
    }
}
