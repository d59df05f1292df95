pub mod aggregate;
pub mod cache;
pub mod config;
pub mod events;
pub mod transition;
pub mod types;

pub use aggregate::{RunDelta, RunProgress};
pub use cache::{ApplyOutcome, OverlayCache};
pub use config::EngineConfig;
pub use events::{OverlayTransition, RunSnapshot, StreamEvent};
pub use transition::{Command, Outcome, Transition, TransitionContext, TransitionError, TransitionKind};
pub use types::*;
