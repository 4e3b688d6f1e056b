pub mod clock;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod monitor;
pub mod mount;
pub mod profile;
pub mod session;
pub mod template;

pub use clock::{NetClockPublisher, ReferenceClock};
pub use control::{ControlConfig, ControlEvent, ControlPlane};
pub use error::{Error, Result};
pub use events::{Event, EventEmitter};
pub use profile::{Profile, ProfileTrigger};
pub use template::{PipelineTemplate, StageDescriptor, SuspendPolicy};
