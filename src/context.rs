//! The launcher context: an explicit environment map built from resolved
//! context files and applied to the process in a single boundary call.
//! Merge logic stays pure so it can be tested without touching the process
//! environment.

use crate::cfg::{self, ContextFile};
use crate::envdiff::EnvMap;
use crate::util::{absolutize, expand_vars, PATH_SEP};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct Context {
    values: BTreeMap<String, String>,
    unset: BTreeSet<String>,
}

impl Context {
    /// Build a context from resolved files, in order. Later files override
    /// earlier ones for plain variables and prepend for reserved ones.
    pub fn from_files(files: &[PathBuf]) -> Result<Self> {
        let mut context = Self::default();
        for path in files {
            let file = cfg::load(path)?;
            context.merge_file(&file);
        }
        Ok(context)
    }

    pub fn merge_file(&mut self, file: &ContextFile) {
        for name in &file.unset {
            self.unset_variable(name);
        }
        for (name, elements) in &file.reserved {
            let separator = cfg::separator_for(name);
            let paths: Vec<String> = elements
                .iter()
                .filter(|element| !element.is_empty())
                .map(|element| absolutize(Path::new(element)).display().to_string())
                .collect();
            self.add_to_variable(name, &paths.join(separator), separator);
        }
        for (name, value) in &file.vars {
            self.set_variable(name, value, true);
        }
    }

    /// Fold in the extra environment computed by the differ; plain
    /// overwrite semantics.
    pub fn extend_plain(&mut self, extra: &EnvMap) {
        for (name, value) in extra {
            self.set_variable(name, value, true);
        }
    }

    pub fn set_variable(&mut self, name: &str, value: &str, overwrite: bool) {
        if self.lookup(name).is_some() {
            if !overwrite {
                tracing::warn!(name, value, "variable already set; not overwritten");
                return;
            }
            tracing::warn!(name, value, "overwriting variable");
        }
        let value = self.expand(value);
        self.unset.remove(name);
        self.values.insert(name.to_string(), value);
    }

    pub fn unset_variable(&mut self, name: &str) {
        self.values.remove(name);
        self.unset.insert(name.to_string());
    }

    /// Append semantics for reserved variables: the new value comes first,
    /// then the separator, then whatever was already there.
    pub fn add_to_variable(&mut self, name: &str, value: &str, separator: &str) {
        if value.is_empty() {
            return;
        }
        let value = self.expand(value);
        let merged = match self.lookup(name) {
            Some(existing) => format!("{value}{separator}{existing}"),
            None => value,
        };
        self.unset.remove(name);
        self.values.insert(name.to_string(), merged);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.lookup(name)
    }

    /// Expand `$VAR`/`${VAR}` against the context first, then the process
    /// environment.
    pub fn expand(&self, value: &str) -> String {
        expand_vars(value, |name| self.lookup(name))
    }

    /// Directories bare script names are resolved through: the context's
    /// `PYTHONPATH`, in order.
    pub fn script_search_paths(&self) -> Vec<PathBuf> {
        self.lookup("PYTHONPATH")
            .map(|value| {
                value
                    .split(PATH_SEP)
                    .filter(|entry| !entry.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The single boundary that mutates the process environment.
    pub fn apply(&self) {
        for name in &self.unset {
            tracing::debug!(name = name.as_str(), "unset variable");
            std::env::remove_var(name);
        }
        for (name, value) in &self.values {
            tracing::debug!(name = name.as_str(), value = value.as_str(), "set variable");
            std::env::set_var(name, value);
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }
        if self.unset.contains(name) {
            return None;
        }
        std::env::var(name).ok()
    }
}
