mod parser;
mod registry;

pub use parser::{parse_intent, Intent};
pub use registry::EDIT_HELP_COMMANDS;
