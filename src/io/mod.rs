//! Process and filesystem boundaries: external command invocation,
//! plain-text manifests, and stage completion markers.

pub mod command;
pub mod manifest;
pub mod markers;

pub use command::{CommandOutcome, CommandRunner, CommandStatus};
pub use markers::{Completion, MarkerStore};
