//! Data contracts and pure state machines of the Couture studio.
//!
//! Nothing in this crate performs network I/O; the engine crate drives these
//! types against real or dryrun backends.

pub mod commands;
pub mod error;
pub mod events;
pub mod history;
pub mod prompt;
pub mod sessions;
pub mod versions;

pub use error::{StudioError, StudioResult};
