//! Error types for the cribcast control plane.

/// Errors that can occur in the control plane.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Configuration**: [`Configuration`](Self::Configuration),
///   [`DuplicateTemplate`](Self::DuplicateTemplate) — fatal at startup,
///   the process must exit before serving.
/// - **Mount resolution**: [`NoSuchMount`](Self::NoSuchMount),
///   [`UnknownTemplate`](Self::UnknownTemplate),
///   [`DeviceUnavailable`](Self::DeviceUnavailable) — surfaced per attach,
///   the viewer sees a failed connect and nothing else changes.
/// - **Engine**: [`EngineConstruction`](Self::EngineConstruction) — the
///   engine could not realize a stage graph;
///   [`Engine`](Self::Engine) — a running pipeline failed afterwards.
/// - **Transport**: [`Io`](Self::Io) — socket/bind failures (clock
///   publisher, event sink).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid template or mount configuration detected at load time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A template with this name is already registered.
    #[error("duplicate template: {0}")]
    DuplicateTemplate(String),

    /// No template registered under this name.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// No mount point registered at the requested path.
    #[error("no such mount: {0}")]
    NoSuchMount(String),

    /// The capture device backing the template is exclusively bound to
    /// another live pipeline instance.
    #[error("device {device} unavailable (held by instance {held_by})")]
    DeviceUnavailable { device: String, held_by: String },

    /// The pipeline engine could not build a runnable pipeline from the
    /// template's stage graph (e.g. a capture device is absent).
    #[error("engine failed to construct pipeline from template {template}: {reason}")]
    EngineConstruction { template: String, reason: String },

    /// A running pipeline instance entered an error state.
    #[error("pipeline instance {instance} failed: {reason}")]
    Engine { instance: String, reason: String },
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
