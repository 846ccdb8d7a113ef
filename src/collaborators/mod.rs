//! Built-in collaborators
//!
//! - `local_file`: files on the local disk
//! - `null`: fallback for every other resource type; records its resolved
//!   configuration as state
//! - shell: imperative actions run through an interpreter
//! - `inline`: module expander whose members are spelled out in its config

mod inline;
mod local_file;
mod null;
mod shell;

pub use inline::InlineModule;
pub use local_file::LocalFile;
pub use null::NullResource;
pub use shell::ShellAction;

use converge::{CollaboratorError, CollaboratorRegistry, Config};
use serde_json::Value;

use crate::config::Settings;

/// Registry with every built-in collaborator and the configured provider
pub fn registry(settings: &Settings) -> CollaboratorRegistry {
    CollaboratorRegistry::new()
        .with_resource("local_file", LocalFile)
        .with_fallback(NullResource)
        .with_action(ShellAction)
        .with_expander("inline", InlineModule)
        .with_provider(settings.provider.clone())
}

/// Required string field of a collaborator config
fn required_str<'a>(config: &'a Config, field: &str) -> Result<&'a str, CollaboratorError> {
    match config.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(CollaboratorError::permanent(format!(
            "\"{field}\" must be a string, got {other}"
        ))),
        None => Err(CollaboratorError::permanent(format!("\"{field}\" is required"))),
    }
}

/// Map an I/O error onto the retry taxonomy
fn io_error(err: std::io::Error, what: String) -> CollaboratorError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            CollaboratorError::transient(format!("{what}: {err}"))
        }
        _ => CollaboratorError::Other(anyhow::Error::new(err).context(what)),
    }
}
