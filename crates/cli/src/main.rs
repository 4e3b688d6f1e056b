use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;

use cribcast::engine::process::ProcessEngine;
use cribcast::monitor;
use cribcast::mount::MountPoint;
use cribcast::{
    ControlConfig, ControlEvent, ControlPlane, EventEmitter, NetClockPublisher, PipelineTemplate,
    Profile, ProfileTrigger, Result, StageDescriptor, SuspendPolicy,
};

#[derive(Parser)]
#[command(
    name = "cribcast-server",
    about = "Baby-monitor streaming server with day/night profiles"
)]
struct Args {
    /// Port to listen on (streaming endpoint and clock distribution)
    #[arg(long, short, default_value_t = 8554)]
    port: u16,

    /// Capture device for the audio templates and the level monitor
    #[arg(long)]
    audio_device: Option<String>,

    /// Launcher binary the pipeline engine runs templates under
    #[arg(long, default_value = "gst-launch-1.0")]
    launcher: String,

    /// Switch profiles automatically from ambient loudness instead of
    /// waiting for operator commands
    #[arg(long)]
    auto_profile: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("cribcast-server: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<()> {
    let engine = Arc::new(ProcessEngine::new(&args.launcher));
    let config = ControlConfig {
        initial_profile: Profile::Day,
        trigger: if args.auto_profile {
            ProfileTrigger::Automatic {
                night_below: 0.05,
                day_above: 0.3,
            }
        } else {
            ProfileTrigger::Operator
        },
        ..ControlConfig::default()
    };

    let mut plane = ControlPlane::new(engine, EventEmitter::stdout(), config);

    let device = args.audio_device.as_deref();
    plane.templates().register(audio_template(device)?)?;
    plane.templates().register(video_template_day()?)?;
    plane.templates().register(video_template_night()?)?;
    plane
        .templates()
        .register(monitor::level_template("level-monitor", device)?)?;

    plane
        .mounts()
        .add(MountPoint::with_profiles("/audiovideo", "video-day", "video-night"))?;
    plane.mounts().add(MountPoint::new("/audiovideoday", "video-day"))?;
    plane.mounts().add(MountPoint::new("/audio", "audio-only"))?;

    // Fatal when the bind fails: without the clock no remote endpoint can
    // synchronize playback.
    let _clock = NetClockPublisher::publish(plane.clock().clone(), "0.0.0.0", args.port)?;

    plane.start_monitor("level-monitor")?;

    let shutdown = plane.sender();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        let _ = shutdown.send(ControlEvent::Shutdown);
    });

    println!("stream ready at rtsp://127.0.0.1:{}", args.port);
    plane.run();
    Ok(())
}

fn audio_template(device: Option<&str>) -> Result<PipelineTemplate> {
    let mut source = StageDescriptor::new("pulsesrc")?;
    if let Some(device) = device {
        source = source.with_property("device", device);
    }
    PipelineTemplate::new(
        "audio-only",
        vec![
            source,
            StageDescriptor::new(
                "audio/x-raw,rate=48000,format=(string)S16LE,layout=(string)interleaved,channels=1",
            )?,
            StageDescriptor::new("audiorate")?,
            StageDescriptor::new("audioresample")?,
            StageDescriptor::new(
                "audio/x-raw,channels=(int)1,rate=(int)16000,layout=(string)interleaved,format=(string)S16LE",
            )?,
            StageDescriptor::new("audioconvert")?.with_property("noise-shaping", "simple"),
            StageDescriptor::new("rtpL16pay")?
                .with_property("name", "pay0")
                .with_property("pt", "96"),
        ],
    )
}

fn video_template_day() -> Result<PipelineTemplate> {
    PipelineTemplate::new(
        "video-day",
        vec![
            StageDescriptor::new("rpicamsrc")?
                .with_property("preview", "false")
                .with_property("video-direction", "90r"),
            h264_caps()?,
            h264_pay()?,
        ],
    )
    .map(video_markers)
}

fn video_template_night() -> Result<PipelineTemplate> {
    PipelineTemplate::new(
        "video-night",
        vec![
            StageDescriptor::new("rpicamsrc")?
                .with_property("preview", "false")
                .with_property("video-direction", "90r")
                .with_property("brightness", "90")
                .with_property("iso", "800")
                .with_property("contrast", "90"),
            h264_caps()?,
            h264_pay()?,
        ],
    )
    .map(video_markers)
}

fn video_markers(template: PipelineTemplate) -> PipelineTemplate {
    template
        .suspend_policy(SuspendPolicy::SuspendWhenIdle)
        .exclusive_device("rpicam")
        .with_video()
}

fn h264_caps() -> Result<StageDescriptor> {
    StageDescriptor::new(
        "video/x-h264,width=320,height=240,framerate=10/1,profile=constrained-baseline",
    )
}

fn h264_pay() -> Result<StageDescriptor> {
    Ok(StageDescriptor::new("rtph264pay")?
        .with_property("name", "pay0")
        .with_property("pt", "96"))
}
