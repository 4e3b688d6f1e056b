//! End-to-end control-plane scenarios over a scripted engine.
//!
//! Builds a full [`ControlPlane`], registers the day/night/audio templates
//! and mounts, and drives it with synthetic events the way the transport
//! and engine would.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use cribcast::clock::ReferenceClock;
use cribcast::control::{ControlConfig, ControlEvent, ControlPlane};
use cribcast::engine::{EngineEvent, EngineStatus, PipelineEngine, PipelineHandle};
use cribcast::events::EventEmitter;
use cribcast::monitor::LevelSample;
use cribcast::mount::MountPoint;
use cribcast::profile::{Profile, ProfileTrigger};
use cribcast::template::{PipelineTemplate, StageDescriptor, SuspendPolicy};

/// Engine that records every build and can be told to fail the next one.
#[derive(Default)]
struct ScriptedEngine {
    builds: AtomicUsize,
    fail_next: AtomicBool,
}

struct ScriptedHandle;

impl PipelineHandle for ScriptedHandle {
    fn play(&mut self) -> cribcast::Result<()> {
        Ok(())
    }
    fn pause(&mut self) -> cribcast::Result<()> {
        Ok(())
    }
    fn stop(&mut self) -> cribcast::Result<()> {
        Ok(())
    }
}

impl PipelineEngine for ScriptedEngine {
    fn build(
        &self,
        _instance_id: &str,
        template: &PipelineTemplate,
        _clock: &ReferenceClock,
        _bus: Sender<EngineEvent>,
    ) -> cribcast::Result<Box<dyn PipelineHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(cribcast::Error::EngineConstruction {
                template: template.name().to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle))
    }
}

/// Shared in-memory event sink for asserting on the emitted JSON stream.
#[derive(Clone, Default)]
struct CapturedEvents(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedEvents {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedEvents {
    fn records(&self) -> Vec<serde_json::Value> {
        String::from_utf8(self.0.lock().clone())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn count_action(&self, action: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.get("action").and_then(|a| a.as_str()) == Some(action))
            .count()
    }
}

struct Fixture {
    engine: Arc<ScriptedEngine>,
    events: CapturedEvents,
    plane: ControlPlane,
}

fn viewer_ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
}

fn stage(element: &str) -> StageDescriptor {
    StageDescriptor::new(element).unwrap()
}

fn fixture(config: ControlConfig) -> Fixture {
    let engine = Arc::new(ScriptedEngine::default());
    let events = CapturedEvents::default();
    let emitter = EventEmitter::with_sink(Box::new(events.clone()));
    let plane = ControlPlane::new(engine.clone(), emitter, config);

    plane
        .templates()
        .register(PipelineTemplate::new("audio-only", vec![stage("pulsesrc")]).unwrap())
        .unwrap();
    plane
        .templates()
        .register(
            PipelineTemplate::new("video-day", vec![stage("rpicamsrc")])
                .unwrap()
                .suspend_policy(SuspendPolicy::SuspendWhenIdle)
                .with_video(),
        )
        .unwrap();
    plane
        .templates()
        .register(
            PipelineTemplate::new("video-night", vec![stage("rpicamsrc")])
                .unwrap()
                .suspend_policy(SuspendPolicy::SuspendWhenIdle)
                .with_video(),
        )
        .unwrap();

    plane
        .mounts()
        .add(MountPoint::with_profiles(
            "/audiovideo",
            "video-day",
            "video-night",
        ))
        .unwrap();
    plane
        .mounts()
        .add(MountPoint::new("/audio", "audio-only"))
        .unwrap();

    Fixture {
        engine,
        events,
        plane,
    }
}

fn default_fixture() -> Fixture {
    fixture(ControlConfig::default())
}

#[test]
fn shared_mount_serves_two_viewers_from_one_instance() {
    let mut f = default_fixture();

    let a = f.plane.client_connect("/audiovideo", viewer_ip(10)).unwrap();
    let b = f.plane.client_connect("/audiovideo", viewer_ip(11)).unwrap();

    assert_eq!(f.engine.builds.load(Ordering::SeqCst), 1);
    assert_eq!(a.instance_id, b.instance_id);
    assert_eq!(f.plane.mounts().live_instances("/audiovideo"), 1);
    assert_eq!(f.events.count_action("client-connected"), 2);
    // Only the first attach started the video pipeline.
    assert_eq!(f.events.count_action("video-started"), 1);

    // First disconnect leaves the instance running.
    f.plane.client_disconnect(&a.id);
    assert_eq!(f.plane.mounts().live_instances("/audiovideo"), 1);
    assert_eq!(f.events.count_action("stream-removed"), 0);

    // Second disconnect drains and stops it.
    f.plane.client_disconnect(&b.id);
    assert_eq!(f.plane.mounts().live_instances("/audiovideo"), 0);
    assert_eq!(f.events.count_action("stream-removed"), 1);
}

#[test]
fn unknown_path_fails_without_instantiating() {
    let mut f = default_fixture();
    let err = f.plane.client_connect("/garage", viewer_ip(10)).unwrap_err();
    assert!(matches!(err, cribcast::Error::NoSuchMount(_)));
    assert_eq!(f.engine.builds.load(Ordering::SeqCst), 0);
    assert_eq!(f.events.count_action("client-connected"), 0);
    assert!(f.plane.sessions().is_empty());
}

#[test]
fn double_disconnect_is_a_no_op() {
    let mut f = default_fixture();
    let session = f.plane.client_connect("/audio", viewer_ip(10)).unwrap();

    f.plane.client_disconnect(&session.id);
    f.plane.client_disconnect(&session.id);

    assert_eq!(f.events.count_action("client-disconnected"), 1);
}

#[test]
fn sweep_reclaims_a_silent_viewer_exactly_once() {
    let mut f = fixture(ControlConfig {
        session_timeout: Duration::from_secs(10),
        ..ControlConfig::default()
    });

    let session = f.plane.client_connect("/audiovideo", viewer_ip(10)).unwrap();
    // A silent partition: no disconnect callback, no activity.
    let later = Instant::now() + Duration::from_secs(11);

    f.plane.sweep_at(later);
    assert_eq!(f.events.count_action("client-disconnected"), 1);
    assert!(f.plane.sessions().get(&session.id).is_none());
    assert_eq!(f.plane.mounts().live_instances("/audiovideo"), 0);

    // Running the sweep again must not double-report.
    f.plane.sweep_at(later + Duration::from_secs(5));
    assert_eq!(f.events.count_action("client-disconnected"), 1);
}

#[test]
fn keepalive_activity_defers_the_sweep() {
    let mut f = default_fixture();
    let session = f.plane.client_connect("/audio", viewer_ip(10)).unwrap();

    let t = Instant::now() + Duration::from_secs(8);
    f.plane.sessions().touch_at(&session.id, t);
    f.plane.sweep_at(t + Duration::from_secs(5));

    assert!(f.plane.sessions().get(&session.id).is_some());
    assert_eq!(f.events.count_action("client-disconnected"), 0);
}

#[test]
fn profile_flip_reassigns_varying_mounts_and_spares_audio() {
    let mut f = default_fixture();

    let audio = f.plane.client_connect("/audio", viewer_ip(10)).unwrap();
    let video = f.plane.client_connect("/audiovideo", viewer_ip(11)).unwrap();
    assert_eq!(f.plane.profile(), Profile::Day);

    f.plane.set_profile(Profile::Night);
    assert_eq!(f.plane.profile(), Profile::Night);
    assert_eq!(f.events.count_action("profile-changed"), 1);

    // The audio viewer's instance is untouched: /audio does not vary by
    // profile in this configuration.
    assert!(f.plane.sessions().get(&audio.id).is_some());
    assert_eq!(f.plane.mounts().live_instances("/audio"), 1);

    // The attached day-video instance drains; the viewer stays connected
    // until it detaches, and only the next resolve builds the night
    // template.
    assert!(f.plane.sessions().get(&video.id).is_some());
    assert_eq!(f.plane.mounts().live_instances("/audiovideo"), 0);

    let night = f.plane.client_connect("/audiovideo", viewer_ip(12)).unwrap();
    assert_ne!(night.instance_id, video.instance_id);
    assert_eq!(f.engine.builds.load(Ordering::SeqCst), 3);
}

#[test]
fn profile_transitions_are_debounced_under_sample_bursts() {
    let mut f = fixture(ControlConfig {
        trigger: ProfileTrigger::Automatic {
            night_below: 0.05,
            day_above: 0.3,
        },
        profile_dwell: Duration::from_secs(60),
        level_window: 1,
        ..ControlConfig::default()
    });

    // A burst of quiet samples: exactly one Day -> Night transition.
    for _ in 0..50 {
        f.plane.on_level(LevelSample::from_db(-60.0, -60.0, -60.0));
    }
    assert_eq!(f.plane.profile(), Profile::Night);
    assert_eq!(f.events.count_action("profile-changed"), 1);

    // Loud burst inside the dwell window: still Night.
    for _ in 0..50 {
        f.plane.on_level(LevelSample::from_db(0.0, 0.0, 0.0));
    }
    assert_eq!(f.plane.profile(), Profile::Night);
    assert_eq!(f.events.count_action("profile-changed"), 1);
}

#[test]
fn only_significant_level_samples_reach_the_event_stream() {
    let mut f = default_fixture();

    // Quiet room, then a cry.
    f.plane.on_level(LevelSample::from_db(-40.0, -40.0, -40.0));
    f.plane.on_level(LevelSample::from_db(-6.0, -3.0, -4.0));

    let levels: Vec<_> = f
        .events
        .records()
        .into_iter()
        .filter(|r| r.get("normrms").is_some())
        .collect();
    assert_eq!(levels.len(), 1);
    let norm = levels[0]["normrms"].as_f64().unwrap();
    assert!((norm - 10f64.powf(-6.0 / 20.0)).abs() < 1e-9);
    // Level records are bare measurements, not tagged actions.
    assert!(levels[0].get("action").is_none());
}

#[test]
fn engine_failure_force_disconnects_and_leaves_mount_resolvable() {
    let mut f = default_fixture();

    let a = f.plane.client_connect("/audiovideo", viewer_ip(10)).unwrap();
    let b = f.plane.client_connect("/audiovideo", viewer_ip(11)).unwrap();
    assert_eq!(a.instance_id, b.instance_id);

    // The running pipeline dies.
    f.plane.dispatch(ControlEvent::Engine(EngineEvent {
        instance: a.instance_id.clone(),
        status: EngineStatus::Error("capture stalled".to_string()),
    }));

    assert_eq!(f.events.count_action("client-disconnected"), 2);
    assert_eq!(f.events.count_action("stream-removed"), 1);
    assert!(f.plane.sessions().is_empty());

    // Lazy retry: the next attach instantiates fresh.
    let c = f.plane.client_connect("/audiovideo", viewer_ip(12)).unwrap();
    assert_ne!(c.instance_id, a.instance_id);
}

#[test]
fn construction_failure_surfaces_to_the_viewer_only() {
    let mut f = default_fixture();
    f.engine.fail_next.store(true, Ordering::SeqCst);

    let err = f.plane.client_connect("/audiovideo", viewer_ip(10)).unwrap_err();
    assert!(matches!(err, cribcast::Error::EngineConstruction { .. }));
    assert!(f.plane.sessions().is_empty());
    assert_eq!(f.events.count_action("client-connected"), 0);

    // The mount still works once the device comes back.
    assert!(f.plane.client_connect("/audiovideo", viewer_ip(10)).is_ok());
}

#[test]
fn shutdown_event_stops_the_dispatch_loop() {
    let f = default_fixture();
    let sender = f.plane.sender();
    let mut plane = f.plane;

    let _viewer = plane.client_connect("/audio", viewer_ip(10)).unwrap();
    sender.send(ControlEvent::Shutdown).unwrap();
    // Returns promptly instead of blocking on the ticker.
    plane.run();
    assert_eq!(plane.mounts().live_instances("/audio"), 0);
}
