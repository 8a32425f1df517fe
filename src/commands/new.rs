//! `strata new`: scaffold a migration that depends on the current heads.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use itertools::Itertools;
use tracing::{info, warn};

use crate::config::Settings;
use crate::constants::{MIGRATION_EXTENSION, SCAFFOLD_TEMP_PREFIX};
use crate::error::{Error, Result};
use crate::migration::read_migrations;
use crate::migration::sort::DependencyGraph;

#[derive(Debug, Clone)]
pub struct NewOptions {
    pub sources: Vec<PathBuf>,
    pub message: Option<String>,
    pub batch_mode: bool,
}

/// Create a new migration file and print its path.
pub async fn new_migration(options: &NewOptions, settings: &Settings) -> Result<()> {
    let directory = options.sources.first().ok_or_else(|| {
        Error::InvalidArgument("please specify a migrations directory".to_string())
    })?;
    if !directory.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "migration source directory {} does not exist",
            directory.display()
        )));
    }

    let migrations = read_migrations(std::slice::from_ref(directory))?;
    migrations.load_all()?;
    let mut heads = DependencyGraph::new(&migrations)?.heads();
    heads.sort_by(|a, b| a.id().cmp(b.id()));

    let message = options.message.as_deref().unwrap_or("");
    let mut source = String::new();
    if !message.is_empty() {
        source.push_str(&format!("-- {message}\n"));
    }
    source.push_str(&format!(
        "-- strata:depends {}\n",
        heads.iter().map(|m| m.id()).join(" ")
    ));
    source.push_str("-- strata:step\n\n-- strata:rollback\n\n");

    let path = next_filename(directory, &settings.prefix, message)?;
    let written = if options.batch_mode {
        std::fs::write(&path, &source).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?;
        Some(path)
    } else {
        create_with_editor(directory, &path, &source, settings)?
    };

    let Some(path) = written else {
        println!("Aborted");
        return Ok(());
    };

    if let Some(command) = &settings.post_create_command {
        run_post_create_command(command, &path);
    }
    println!("Created file {}", path.display());
    Ok(())
}

/// `{prefix}{YYYYMMDD}_{NN}_{slug}.sql` with the first free sequence
/// number for today.
fn next_filename(directory: &Path, prefix: &str, message: &str) -> Result<PathBuf> {
    let date = Utc::now().format("%Y%m%d");
    let slug = slugify(message);
    for sequence in 1..100u32 {
        let name = if slug.is_empty() {
            format!("{prefix}{date}_{sequence:02}.{MIGRATION_EXTENSION}")
        } else {
            format!("{prefix}{date}_{sequence:02}_{slug}.{MIGRATION_EXTENSION}")
        };
        let candidate = directory.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::InvalidArgument(format!(
        "too many migrations created today in {}",
        directory.display()
    )))
}

fn slugify(message: &str) -> String {
    let mut slug: String = message
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}

/// Open the scaffold in the user's editor via a temp file; keep it only if
/// saved non-empty.
fn create_with_editor(
    directory: &Path,
    path: &Path,
    source: &str,
    settings: &Settings,
) -> Result<Option<PathBuf>> {
    let temp_path = directory.join(format!(
        "{SCAFFOLD_TEMP_PREFIX}{}.{MIGRATION_EXTENSION}",
        std::process::id()
    ));
    std::fs::write(&temp_path, source).map_err(|source| Error::Io {
        path: temp_path.clone(),
        source,
    })?;

    let editor = editor_command(settings);
    let status = Command::new(&editor).arg(&temp_path).status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(Error::InvalidArgument(format!(
                "editor {editor:?} exited with {status}"
            )));
        }
        Err(source) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(Error::Io {
                path: PathBuf::from(editor),
                source,
            });
        }
    }

    let edited = std::fs::read_to_string(&temp_path).map_err(|source| Error::Io {
        path: temp_path.clone(),
        source,
    })?;
    if edited.trim().is_empty() {
        let _ = std::fs::remove_file(&temp_path);
        return Ok(None);
    }
    std::fs::rename(&temp_path, path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(path.to_path_buf()))
}

fn editor_command(settings: &Settings) -> String {
    settings
        .editor
        .clone()
        .or_else(|| std::env::var("VISUAL").ok())
        .or_else(|| std::env::var("EDITOR").ok())
        .unwrap_or_else(|| "vi".to_string())
}

fn run_post_create_command(command: &str, path: &Path) {
    let parts: Vec<String> = command
        .split_whitespace()
        .map(|part| part.replace("{}", &path.to_string_lossy()))
        .collect();
    let Some((program, args)) = parts.split_first() else {
        return;
    };
    info!("running command: {}", parts.join(" "));
    if let Err(e) = Command::new(program).args(args).status() {
        warn!("post-create command failed: {e}");
    }
}
