//! Migrations, the id-unique migration collection and source discovery.

pub mod parser;
pub mod sort;
pub mod step;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::backend::DatabaseBackend;
use crate::constants::{MIGRATION_EXTENSION, POST_APPLY_PREFIX, SCAFFOLD_TEMP_PREFIX};
use crate::error::{Error, Result};
use crate::migration::parser::{ParsedSource, parse_source};
use crate::migration::step::{Direction, Step};

/// The database key for a migration: lowercase hex SHA-256 of its id.
pub fn migration_hash(migration_id: &str) -> String {
    let digest = Sha256::digest(migration_id.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Normal migrations are tracked and toposorted; post-apply hooks run after
/// every apply invocation and are never marked as applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Normal,
    PostApply,
}

struct Loaded {
    source: String,
    depends: Vec<String>,
    use_transactions: bool,
    steps: Vec<Step>,
}

/// A named schema change loaded from a source file.
///
/// The id is the file's stem; steps and dependencies are parsed on first
/// use and memoized.
pub struct Migration {
    id: String,
    hash: String,
    path: PathBuf,
    kind: MigrationKind,
    loaded: OnceCell<Loaded>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Migration {:?} from {}>", self.id, self.path.display())
    }
}

impl Migration {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>, kind: MigrationKind) -> Self {
        let id = id.into();
        Migration {
            hash: migration_hash(&id),
            id,
            path: path.into(),
            kind,
            loaded: OnceCell::new(),
        }
    }

    /// Construct from a source path, classifying post-apply hooks by their
    /// filename prefix. Returns `None` for files that are not migrations
    /// (wrong extension, scaffold temp files).
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.extension().and_then(|e| e.to_str()) != Some(MIGRATION_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        if stem.starts_with(SCAFFOLD_TEMP_PREFIX) {
            return None;
        }
        let kind = if stem.starts_with(POST_APPLY_PREFIX) {
            MigrationKind::PostApply
        } else {
            MigrationKind::Normal
        };
        Some(Migration::new(stem, path, kind))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    pub fn loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Parse the source file, resolving dependency ids against
    /// `known_ids`. Idempotent; the first call wins.
    pub fn load(&self, known_ids: &HashSet<String>) -> Result<()> {
        self.loaded.get_or_try_init(|| {
            let source =
                std::fs::read_to_string(&self.path).map_err(|source| Error::Io {
                    path: self.path.clone(),
                    source,
                })?;
            let parsed: ParsedSource = parse_source(&self.id, &source)?;
            for dep in &parsed.depends {
                if !known_ids.contains(dep) {
                    return Err(Error::BadMigration(format!(
                        "could not resolve dependencies in {} (unknown id {dep:?})",
                        self.path.display()
                    )));
                }
            }
            let steps = parsed.create_steps(parsed.transactional);
            Ok(Loaded {
                source,
                depends: parsed.depends,
                use_transactions: parsed.transactional,
                steps,
            })
        })?;
        Ok(())
    }

    fn loaded_ref(&self) -> Result<&Loaded> {
        self.loaded.get().ok_or_else(|| {
            Error::BadMigration(format!("migration {} has not been loaded", self.id))
        })
    }

    pub fn depends(&self) -> Result<&[String]> {
        Ok(&self.loaded_ref()?.depends)
    }

    pub fn use_transactions(&self) -> Result<bool> {
        Ok(self.loaded_ref()?.use_transactions)
    }

    pub fn steps(&self) -> Result<&[Step]> {
        Ok(&self.loaded_ref()?.steps)
    }

    pub fn source(&self) -> Result<&str> {
        Ok(&self.loaded_ref()?.source)
    }

    /// Run this migration's steps in `direction`.
    ///
    /// Transactional migrations execute inside one outer transaction (step
    /// wrappers nest via savepoints). When a step fails on a backend
    /// without transactional DDL, or in a non-transactional migration,
    /// already-executed steps are compensated by running them in the
    /// reverse direction before the error propagates.
    pub async fn process_steps(
        &self,
        backend: &mut DatabaseBackend,
        direction: Direction,
        force: bool,
    ) -> Result<()> {
        let loaded = self.loaded_ref()?;
        let reverse = direction.reverse();

        let steps: Vec<&Step> = match direction {
            Direction::Apply => loaded.steps.iter().collect(),
            Direction::Rollback => loaded.steps.iter().rev().collect(),
        };

        let outer = if loaded.use_transactions {
            Some(backend.begin_tx().await?)
        } else {
            backend.ensure_autocommit().await?;
            None
        };

        let mut executed: Vec<&Step> = Vec::new();
        let mut failure: Option<Error> = None;
        for step in steps {
            match step.execute(backend, direction, force).await {
                Ok(()) => executed.push(step),
                Err(e) => {
                    let compensate = e.is_database_error()
                        && (!backend.has_transactional_ddl() || !loaded.use_transactions);
                    if compensate {
                        // Committed DDL survives the outer rollback; undo
                        // what already ran, as far as that is possible.
                        for done in executed.iter().rev() {
                            if let Err(undo) = done.execute(backend, reverse, false).await {
                                error!("could not {} step: {undo}", reverse.label());
                                break;
                            }
                        }
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        match (failure, outer) {
            (None, Some(tx)) => backend.commit_tx(tx).await,
            (None, None) => Ok(()),
            (Some(e), Some(tx)) => {
                let _ = backend.rollback_tx(tx).await;
                Err(e)
            }
            (Some(e), None) => Err(e),
        }
    }
}

/// A migration together with its applied status, used for reporting.
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub migration: Arc<Migration>,
    pub applied: bool,
}

/// An ordered, id-unique collection of migrations, with a sibling list of
/// post-apply hooks.
#[derive(Default, Clone)]
pub struct MigrationSet {
    items: Vec<Arc<Migration>>,
    ids: HashSet<String>,
    post_apply: Vec<Arc<Migration>>,
}

impl MigrationSet {
    pub fn new(items: Vec<Arc<Migration>>) -> Result<Self> {
        Self::with_post_apply(items, Vec::new())
    }

    pub fn with_post_apply(
        items: Vec<Arc<Migration>>,
        post_apply: Vec<Arc<Migration>>,
    ) -> Result<Self> {
        let mut set = MigrationSet {
            items: Vec::with_capacity(items.len()),
            ids: HashSet::new(),
            post_apply,
        };
        for item in items {
            set.push(item)?;
        }
        Ok(set)
    }

    pub fn push(&mut self, migration: Arc<Migration>) -> Result<()> {
        if !self.ids.insert(migration.id().to_string()) {
            return Err(Error::MigrationConflict(migration.id().to_string()));
        }
        self.items.push(migration);
        Ok(())
    }

    pub fn push_post_apply(&mut self, migration: Arc<Migration>) {
        self.post_apply.push(migration);
    }

    pub fn items(&self) -> &[Arc<Migration>] {
        &self.items
    }

    pub fn post_apply(&self) -> &[Arc<Migration>] {
        &self.post_apply
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Migration>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Migration>> {
        self.items.iter().find(|m| m.id() == id)
    }

    /// A new collection holding the migrations matching `predicate`; the
    /// post-apply list is carried over.
    pub fn filter(&self, predicate: impl Fn(&Migration) -> bool) -> Self {
        let items = self
            .items
            .iter()
            .filter(|m| predicate(m))
            .cloned()
            .collect();
        MigrationSet::with_post_apply(items, self.post_apply.clone())
            .expect("filtering cannot introduce duplicate ids")
    }

    /// A new collection with different items but the same post-apply list.
    pub fn replace(&self, items: Vec<Arc<Migration>>) -> Result<Self> {
        MigrationSet::with_post_apply(items, self.post_apply.clone())
    }

    /// A new collection holding this collection's migrations followed by
    /// `other`'s. Shared ids are a conflict.
    pub fn concat(&self, other: &MigrationSet) -> Result<Self> {
        let mut combined = self.clone();
        for migration in other {
            combined.push(migration.clone())?;
        }
        combined.post_apply.extend(other.post_apply.iter().cloned());
        Ok(combined)
    }

    /// Keep only the first `n` migrations.
    pub fn truncate(&mut self, n: usize) {
        for dropped in self.items.drain(n..) {
            self.ids.remove(dropped.id());
        }
    }

    /// Parse every migration (normal and post-apply), resolving dependency
    /// references against the ids in this collection.
    pub fn load_all(&self) -> Result<()> {
        let known: HashSet<String> = self
            .items
            .iter()
            .chain(&self.post_apply)
            .map(|m| m.id().to_string())
            .collect();
        for migration in self.items.iter().chain(&self.post_apply) {
            migration.load(&known)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a Arc<Migration>;
    type IntoIter = std::slice::Iter<'a, Arc<Migration>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl fmt::Debug for MigrationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

/// Scan `directories` for migration sources, sorted by path.
pub fn read_migrations(directories: &[PathBuf]) -> Result<MigrationSet> {
    let mut set = MigrationSet::default();
    for directory in directories {
        if !directory.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "migration source directory {} does not exist",
                directory.display()
            )));
        }
        let pattern = directory.join(format!("*.{MIGRATION_EXTENSION}"));
        let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::InvalidArgument(format!("bad source directory: {e}")))?
            .filter_map(|entry| entry.ok())
            .collect();
        paths.sort();

        for path in paths {
            let Some(migration) = Migration::from_path(&path) else {
                continue;
            };
            match migration.kind() {
                MigrationKind::PostApply => set.push_post_apply(Arc::new(migration)),
                MigrationKind::Normal => set.push(Arc::new(migration))?,
            }
        }
    }
    Ok(set)
}
