//! Named query macros.
//!
//! A macro is a query stored in a `.macro` file under a configured root
//! directory. Its key is `$` followed by the file's directory path relative
//! to the root (separators turned into dots) and the file stem, so
//! `reports/daily.macro` becomes `$reports.daily`. A statement whose text is
//! exactly a macro key is replaced by the macro's query before execution.

use crate::error::{DbError, DbResult};
use crate::models::BatchRequest;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MACRO_PREFIX: char = '$';
pub const MACRO_EXTENSION: &str = "macro";

/// Looks up the query text behind a macro key.
pub trait MacroResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<String>;
}

/// In-memory macro table, optionally backed by a directory.
#[derive(Debug, Default)]
pub struct MacroCache {
    root: Option<PathBuf>,
    macros: RwLock<HashMap<String, String>>,
}

impl MacroCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache whose `reload` reads from `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            macros: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Load every `.macro` file under `dir`, adding to the current table.
    ///
    /// Unreadable files are skipped with a warning. Returns the number of
    /// macros loaded.
    pub fn populate(&self, dir: &Path) -> DbResult<usize> {
        let loaded = load_dir(dir)?;
        let count = loaded.len();
        let mut macros = self.macros.write().unwrap_or_else(PoisonError::into_inner);
        macros.extend(loaded);
        Ok(count)
    }

    /// Replace the table with a fresh read of the root directory.
    ///
    /// Without a root this clears the table. On error the previous table is
    /// kept.
    pub fn reload(&self) -> DbResult<usize> {
        let loaded = match &self.root {
            Some(root) => load_dir(root)?,
            None => HashMap::new(),
        };
        let count = loaded.len();
        *self.macros.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        info!(count, "Macro cache loaded");
        Ok(count)
    }

    /// Store a macro. Keys must start with `$`; empty queries are ignored.
    pub fn put(&self, key: impl Into<String>, query: impl Into<String>) -> bool {
        let key = key.into();
        let query = query.into();
        if !key.starts_with(MACRO_PREFIX) || query.is_empty() {
            return false;
        }
        debug!(key = %key, "Macro added to cache");
        self.macros
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, query);
        true
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.macros
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Sorted macro keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .macros
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.macros.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.macros
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MacroResolver for MacroCache {
    fn resolve(&self, key: &str) -> Option<String> {
        self.get(key)
    }
}

fn load_dir(dir: &Path) -> DbResult<HashMap<String, String>> {
    if !dir.is_dir() {
        return Err(DbError::config(format!(
            "Macro path '{}' is not a directory",
            dir.display()
        )));
    }

    let mut loaded = HashMap::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping macro path entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(MACRO_EXTENSION)
        {
            continue;
        }

        let Some(key) = macro_key(dir, path) else {
            continue;
        };
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let query = text.trim();
                if query.is_empty() {
                    debug!(key = %key, "Skipping empty macro");
                    continue;
                }
                loaded.insert(key, query.to_string());
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot read macro file"),
        }
    }
    Ok(loaded)
}

/// `$` + relative directories joined by dots + file stem.
fn macro_key(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?;
    let stem = relative.file_stem()?.to_str()?;

    let mut key = String::from(MACRO_PREFIX);
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            key.push_str(component.as_os_str().to_str()?);
            key.push('.');
        }
    }
    key.push_str(stem);
    Some(key)
}

/// Replace every macro reference in a request with its query text.
///
/// A statement is a macro reference when its trimmed text starts with `$`.
/// An unknown key fails the whole request.
pub fn expand_macros(request: &mut BatchRequest, resolver: &dyn MacroResolver) -> DbResult<()> {
    for stmt in &mut request.statements {
        let text = stmt.query_text.trim();
        if !text.starts_with(MACRO_PREFIX) {
            continue;
        }
        let query = resolver
            .resolve(text)
            .ok_or_else(|| DbError::malformed(format!("Unknown macro '{}'", text)))?;
        debug!(key = %text, "Expanded macro");
        stmt.query_text = query;
    }
    Ok(())
}
