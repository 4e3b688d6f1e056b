//! Mount points and the live-instance registry.
//!
//! A [`MountPoint`] binds a URL-like path (`/audiovideo`, `/audio`) to one
//! template per profile. [`MountRegistry::resolve`] returns an existing
//! shared instance when one is live, otherwise lazily realizes the mount's
//! currently assigned template through the
//! [`TemplateRegistry`](crate::template::TemplateRegistry).
//!
//! Instance lifecycle: `Created → Playing → Draining → Stopped`. Draining
//! instances accept no new viewers and are torn down once their last
//! reference detaches; stopped instances are removed and never reused — a
//! fresh resolve instantiates from scratch even if the same template is
//! selected again immediately.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::clock::ReferenceClock;
use crate::engine::{EngineEvent, EngineState, PipelineHandle};
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::template::{SuspendPolicy, TemplateRegistry};

/// Lifecycle state of one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Built by the engine, not yet asked to play.
    Created,
    /// Delivering media.
    Playing,
    /// No longer accepting viewers; torn down when the last one detaches.
    Draining,
    /// Torn down. Removed from the registry, never reused.
    Stopped,
}

struct InstanceEntry {
    id: String,
    template: String,
    state: InstanceState,
    viewers: usize,
    shared: bool,
    suspend: SuspendPolicy,
    video: bool,
    handle: Box<dyn PipelineHandle>,
}

impl InstanceEntry {
    fn transition(&mut self, to: InstanceState) {
        tracing::debug!(
            instance_id = %self.id,
            from = ?self.state,
            to = ?to,
            "instance state"
        );
        self.state = to;
    }

    fn is_live(&self) -> bool {
        matches!(self.state, InstanceState::Created | InstanceState::Playing)
    }
}

/// A stream endpoint: path plus the template assigned per profile.
///
/// Mounts whose day and night templates are the same name are
/// profile-invariant; a profile transition never touches them.
pub struct MountPoint {
    path: String,
    day_template: String,
    night_template: String,
    instances: Mutex<Vec<InstanceEntry>>,
}

impl MountPoint {
    /// A mount served by the same template in both profiles.
    pub fn new(path: &str, template: &str) -> Self {
        Self::with_profiles(path, template, template)
    }

    /// A mount whose template varies with the profile.
    pub fn with_profiles(path: &str, day_template: &str, night_template: &str) -> Self {
        Self {
            path: path.to_string(),
            day_template: day_template.to_string(),
            night_template: night_template.to_string(),
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn template_for(&self, profile: Profile) -> &str {
        match profile {
            Profile::Day => &self.day_template,
            Profile::Night => &self.night_template,
        }
    }
}

/// Result of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub instance_id: String,
    /// Whether this attach created a fresh instance (vs. joining a shared one).
    pub created: bool,
    /// Whether the instance's template carries video.
    pub video: bool,
}

/// Result of a detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The instance keeps running (other viewers, or an always-run template).
    Kept,
    /// The instance drained, stopped, and was removed from the registry.
    Removed,
}

/// Registry of mount points and their live pipeline instances.
#[derive(Clone)]
pub struct MountRegistry {
    templates: TemplateRegistry,
    clock: ReferenceClock,
    bus: Sender<EngineEvent>,
    mounts: Arc<RwLock<HashMap<String, Arc<MountPoint>>>>,
}

impl MountRegistry {
    pub fn new(templates: TemplateRegistry, clock: ReferenceClock, bus: Sender<EngineEvent>) -> Self {
        Self {
            templates,
            clock,
            bus,
            mounts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a mount point. Both referenced templates must already be
    /// registered; path bindings are configuration, never computed.
    pub fn add(&self, mount: MountPoint) -> Result<()> {
        for profile in [Profile::Day, Profile::Night] {
            let name = mount.template_for(profile);
            if self.templates.get(name).is_none() {
                return Err(Error::Configuration(format!(
                    "mount {} references unknown template {name}",
                    mount.path()
                )));
            }
        }
        let mut mounts = self.mounts.write();
        if mounts.contains_key(mount.path()) {
            return Err(Error::Configuration(format!(
                "duplicate mount path {}",
                mount.path()
            )));
        }
        tracing::info!(path = mount.path(), "mount registered");
        mounts.insert(mount.path().to_string(), Arc::new(mount));
        Ok(())
    }

    fn get(&self, path: &str) -> Option<Arc<MountPoint>> {
        self.mounts.read().get(path).cloned()
    }

    /// Attach a viewer to `path` under the given profile.
    ///
    /// Joins a live shared instance when one exists and is not draining,
    /// otherwise instantiates the assigned template. Never instantiates for
    /// an unknown path.
    pub fn resolve(&self, path: &str, profile: Profile) -> Result<AttachOutcome> {
        let mount = self
            .get(path)
            .ok_or_else(|| Error::NoSuchMount(path.to_string()))?;
        let template_name = mount.template_for(profile).to_string();
        let template = self
            .templates
            .get(&template_name)
            .ok_or_else(|| Error::UnknownTemplate(template_name.clone()))?;

        let mut instances = mount.instances.lock();

        if template.is_shared()
            && let Some(entry) = instances
                .iter_mut()
                .find(|e| e.template == template_name && e.is_live())
        {
            entry.viewers += 1;
            tracing::debug!(
                path,
                instance_id = %entry.id,
                viewers = entry.viewers,
                "viewer joined shared instance"
            );
            return Ok(AttachOutcome {
                instance_id: entry.id.clone(),
                created: false,
                video: entry.video,
            });
        }

        let id = new_instance_id();
        let handle = self
            .templates
            .instantiate(&template_name, &self.clock, &id, self.bus.clone())?;

        let mut entry = InstanceEntry {
            id: id.clone(),
            template: template_name.clone(),
            state: InstanceState::Created,
            viewers: 1,
            shared: template.is_shared(),
            suspend: template.suspend(),
            video: template.has_video(),
            handle,
        };

        if let Err(e) = entry.handle.play() {
            self.templates.release(&id);
            return Err(e);
        }
        entry.transition(InstanceState::Playing);
        tracing::info!(path, template = %template_name, instance_id = %id, "pipeline instance playing");

        let video = entry.video;
        instances.push(entry);
        Ok(AttachOutcome {
            instance_id: id,
            created: true,
            video,
        })
    }

    /// Release one viewer reference on an instance. Unknown paths or
    /// instances are a no-op, keeping disconnect handling idempotent.
    pub fn detach(&self, path: &str, instance_id: &str) -> DetachOutcome {
        let Some(mount) = self.get(path) else {
            return DetachOutcome::Kept;
        };
        let mut instances = mount.instances.lock();
        let Some(idx) = instances.iter().position(|e| e.id == instance_id) else {
            return DetachOutcome::Kept;
        };

        {
            let entry = &mut instances[idx];
            entry.viewers = entry.viewers.saturating_sub(1);
            tracing::debug!(path, instance_id, viewers = entry.viewers, "viewer detached");
            if entry.viewers > 0 {
                return DetachOutcome::Kept;
            }

            let teardown = entry.state == InstanceState::Draining
                || !entry.shared
                || entry.suspend == SuspendPolicy::SuspendWhenIdle;
            if !teardown {
                return DetachOutcome::Kept;
            }

            if entry.state != InstanceState::Draining {
                entry.transition(InstanceState::Draining);
            }
            self.templates.release(&entry.id);
            if let Err(e) = entry.handle.stop() {
                tracing::warn!(instance_id, error = %e, "stop failed during teardown");
            }
            entry.transition(InstanceState::Stopped);
        }

        instances.remove(idx);
        tracing::info!(path, instance_id, "pipeline instance removed");
        DetachOutcome::Removed
    }

    /// Apply a profile transition to every mount whose template assignment
    /// changes between `from` and `to`.
    ///
    /// Live instances not matching the new assignment start draining (no
    /// new viewer attaches); idle ones are torn down immediately, before
    /// the reassignment is considered complete. Returns the ids of
    /// instances removed so the caller can report them.
    pub fn reassign(&self, from: Profile, to: Profile) -> Vec<String> {
        let mut removed = Vec::new();
        let mounts: Vec<Arc<MountPoint>> = self.mounts.read().values().cloned().collect();

        for mount in mounts {
            if mount.template_for(from) == mount.template_for(to) {
                continue;
            }
            let new_template = mount.template_for(to).to_string();
            let mut instances = mount.instances.lock();

            let mut idx = 0;
            while idx < instances.len() {
                let drain = {
                    let entry = &instances[idx];
                    entry.template != new_template && entry.is_live()
                };
                if !drain {
                    idx += 1;
                    continue;
                }

                let idle = {
                    let entry = &mut instances[idx];
                    entry.transition(InstanceState::Draining);
                    self.templates.release(&entry.id);
                    entry.viewers == 0
                };
                if idle {
                    let mut entry = instances.remove(idx);
                    if let Err(e) = entry.handle.stop() {
                        tracing::warn!(instance_id = %entry.id, error = %e, "stop failed during reassign");
                    }
                    entry.transition(InstanceState::Stopped);
                    removed.push(entry.id);
                } else {
                    tracing::info!(
                        path = mount.path(),
                        instance_id = %instances[idx].id,
                        "instance draining until last viewer detaches"
                    );
                    idx += 1;
                }
            }
        }
        removed
    }

    /// Record an engine-reported state for an instance.
    pub fn note_state(&self, instance_id: &str, state: EngineState) {
        let mounts: Vec<Arc<MountPoint>> = self.mounts.read().values().cloned().collect();
        for mount in mounts {
            let mut instances = mount.instances.lock();
            if let Some(entry) = instances.iter_mut().find(|e| e.id == instance_id) {
                if entry.state == InstanceState::Created && state == EngineState::Running {
                    entry.transition(InstanceState::Playing);
                } else {
                    tracing::trace!(instance_id, engine_state = ?state, "engine state note");
                }
                return;
            }
        }
    }

    /// Forcibly stop and remove a failed instance, wherever it is mounted.
    ///
    /// Returns the mount path it was serving, if it was still registered.
    /// The mount itself stays resolvable; the next attach instantiates
    /// fresh.
    pub fn remove_instance(&self, instance_id: &str) -> Option<String> {
        let mounts: Vec<Arc<MountPoint>> = self.mounts.read().values().cloned().collect();
        for mount in mounts {
            let mut instances = mount.instances.lock();
            if let Some(idx) = instances.iter().position(|e| e.id == instance_id) {
                let mut entry = instances.remove(idx);
                self.templates.release(&entry.id);
                let _ = entry.handle.stop();
                entry.transition(InstanceState::Stopped);
                tracing::info!(
                    path = mount.path(),
                    instance_id,
                    "failed instance removed from mount"
                );
                return Some(mount.path().to_string());
            }
        }
        None
    }

    /// Number of live (non-draining) instances serving a path.
    pub fn live_instances(&self, path: &str) -> usize {
        self.get(path)
            .map(|m| m.instances.lock().iter().filter(|e| e.is_live()).count())
            .unwrap_or(0)
    }

    /// Current state of an instance, if it is still registered.
    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        let mounts: Vec<Arc<MountPoint>> = self.mounts.read().values().cloned().collect();
        for mount in mounts {
            let instances = mount.instances.lock();
            if let Some(entry) = instances.iter().find(|e| e.id == instance_id) {
                return Some(entry.state);
            }
        }
        None
    }

    /// Stop and remove every instance. Called at server shutdown only;
    /// mount points themselves live for the process lifetime.
    pub fn shutdown(&self) {
        let mounts: Vec<Arc<MountPoint>> = self.mounts.read().values().cloned().collect();
        for mount in mounts {
            let mut instances = mount.instances.lock();
            for entry in instances.iter_mut() {
                self.templates.release(&entry.id);
                if let Err(e) = entry.handle.stop() {
                    tracing::warn!(instance_id = %entry.id, error = %e, "stop failed at shutdown");
                }
                entry.transition(InstanceState::Stopped);
            }
            if !instances.is_empty() {
                tracing::info!(
                    path = mount.path(),
                    stopped = instances.len(),
                    "instances stopped at shutdown"
                );
            }
            instances.clear();
        }
    }
}

fn new_instance_id() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}
