//! Interactive confirmation and password prompts.

use dialoguer::{Confirm, Password};

use crate::error::{Error, Result};

fn prompt_failed(e: dialoguer::Error) -> Error {
    Error::Io {
        path: "<stdin>".into(),
        source: std::io::Error::other(e.to_string()),
    }
}

/// Ask a yes/no question.
pub fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(default)
        .interact()
        .map_err(prompt_failed)
}

/// Prompt for a database password without echoing.
pub fn password(prompt: &str) -> Result<String> {
    Password::new()
        .with_prompt(prompt)
        .interact()
        .map_err(prompt_failed)
}
