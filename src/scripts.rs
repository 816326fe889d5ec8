//! Tokenizer for the trailing script mini-language.
//!
//! A flat argument list such as
//! `plot.py args:case1,fast out:pressure python mesh driver -- ls -la`
//! becomes an ordered sequence of [`ScriptInvocation`] records. `args:` and
//! `out:` tokens attach to the invocation whose script token was most
//! recently claimed; the claim is tracked as an explicit index so misplaced
//! tokens are boundary checks, not list surgery.

use crate::util::{absolutize, expand_user};
use anyhow::Context as _;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ARGS_PREFIX: &str = "args:";
pub const OUT_PREFIX: &str = "out:";

/// Everything after this separator is raw passthrough: one external command
/// plus its literal arguments.
const PASSTHROUGH: &str = "--";

/// Reserved name for the workflow-execution tool; recognized without file
/// resolution and never given an interpreter prefix.
const DRIVER: &str = "driver";

const SHEBANG_PROBE_LINES: usize = 10;

/// One resolved script or command, with its attached input arguments and
/// declared output identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    /// Shell-executable command string, possibly `python <path>`.
    pub script: String,
    pub args: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
}

impl ScriptInvocation {
    fn bare(script: String) -> Self {
        Self {
            script,
            args: None,
            outputs: None,
        }
    }
}

/// User-input errors; tokenization aborts on the first one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenizeError {
    /// A `.py`-suffixed token resolved to no file anywhere on the search path.
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("args list must follow the script it belongs to")]
    MisplacedArgsToken,
    #[error("out list must follow the script (and its args list) it belongs to")]
    MisplacedOutToken,
}

/// Tokenize `args` into invocations, resolving bare script names through
/// `search_paths`.
pub fn tokenize_scripts(
    args: &[String],
    search_paths: &[PathBuf],
) -> Result<Vec<ScriptInvocation>, TokenizeError> {
    let (short, extra) = split_passthrough(args);

    let mut invocations: Vec<ScriptInvocation> = Vec::new();
    // index of the invocation still accepting args:/out:
    let mut current: Option<usize> = None;
    // out: stays legal for the last invocation right after its args: token
    let mut after_args = false;
    // a pending `python` token; consumed by the next resolved script
    let mut python_next = false;

    for raw in short {
        if let Some(list) = raw.strip_prefix(ARGS_PREFIX) {
            if python_next {
                return Err(TokenizeError::MisplacedArgsToken);
            }
            let Some(idx) = current.take() else {
                return Err(TokenizeError::MisplacedArgsToken);
            };
            invocations[idx].args = Some(split_list(list));
            after_args = true;
        } else if let Some(list) = raw.strip_prefix(OUT_PREFIX) {
            if (current.is_none() && !after_args) || python_next {
                return Err(TokenizeError::MisplacedOutToken);
            }
            let idx = match current.take() {
                Some(idx) => idx,
                None => invocations.len() - 1,
            };
            invocations[idx].outputs = Some(split_list(list));
            after_args = false;
        } else if raw.starts_with("python") {
            python_next = true;
            after_args = false;
        } else if raw == DRIVER {
            current = Some(invocations.len());
            invocations.push(ScriptInvocation::bare(DRIVER.to_string()));
            python_next = false;
            after_args = false;
        } else {
            let expanded = expand_user(raw);
            let resolved = match resolve_script(&expanded, search_paths) {
                Some(path) => path,
                None => {
                    if raw.ends_with(".py") {
                        return Err(TokenizeError::ScriptNotFound(raw.clone()));
                    }
                    // tolerant fallback: an opaque external command; args:
                    // cannot attach to it
                    invocations.push(ScriptInvocation::bare(raw.clone()));
                    python_next = false;
                    after_args = false;
                    continue;
                }
            };
            if resolved.extension().is_some_and(|ext| ext == "hdf") {
                // study files are not scripts; the token is dropped
                python_next = false;
                after_args = false;
                continue;
            }
            let script = script_path(&resolved, raw);
            let command = if python_next || needs_interpreter(&script) {
                format!("python {}", script.display())
            } else {
                script.display().to_string()
            };
            python_next = false;
            after_args = false;
            current = Some(invocations.len());
            invocations.push(ScriptInvocation::bare(command));
        }
    }

    // syntax: -- program [options] [arguments]
    if extra.len() > 1 {
        invocations.push(ScriptInvocation {
            script: extra[1].clone(),
            args: Some(extra[2..].to_vec()),
            outputs: None,
        });
    }

    Ok(invocations)
}

/// Format invocations as a bash-like one-liner: `script args ; script args`.
/// Arguments are quoted individually; output identifiers are omitted.
pub fn format_invocations(invocations: &[ScriptInvocation]) -> String {
    invocations
        .iter()
        .map(|inv| match &inv.args {
            Some(args) if !args.is_empty() => {
                let quoted = shell_words::join(args.iter().map(String::as_str));
                format!("{} {}", inv.script, quoted)
            }
            _ => inv.script.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ; ")
}

/// JSON payload handed to the session server via `--pyscript=`: a list of
/// `{script: [args...]}` objects. Output identifiers are not exported.
pub fn pyscript_json(invocations: &[ScriptInvocation]) -> anyhow::Result<String> {
    let entries: Vec<PyScriptEntry<'_>> = invocations.iter().map(PyScriptEntry::from).collect();
    serde_json::to_string(&entries).context("encode pyscript payload")
}

/// One `{script: [args...]}` object of the `--pyscript=` payload.
#[derive(Serialize)]
#[serde(transparent)]
struct PyScriptEntry<'a>(BTreeMap<&'a str, &'a [String]>);

impl<'a> From<&'a ScriptInvocation> for PyScriptEntry<'a> {
    fn from(invocation: &'a ScriptInvocation) -> Self {
        let mut entry = BTreeMap::new();
        entry.insert(
            invocation.script.as_str(),
            invocation.args.as_deref().unwrap_or_default(),
        );
        Self(entry)
    }
}

fn split_passthrough(args: &[String]) -> (&[String], &[String]) {
    match args.iter().position(|arg| arg == PASSTHROUGH) {
        Some(pos) => (&args[..pos], &args[pos..]),
        None => (args, &[]),
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|item| expand_user(item).to_string_lossy().into_owned())
        .collect()
}

/// A token is a recognized script when it names an existing file, an
/// existing file with `.py` appended, or either of those through the search
/// path list.
fn resolve_script(expanded: &Path, search_paths: &[PathBuf]) -> Option<PathBuf> {
    if expanded.is_file() || append_py(expanded).is_file() {
        return Some(expanded.to_path_buf());
    }
    if expanded.is_absolute() {
        return None;
    }
    for dir in search_paths {
        let candidate = dir.join(expanded);
        if candidate.is_file() || append_py(&candidate).is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Pick the concrete file the invocation runs: the token itself when it ends
/// in `.py`, otherwise a `.py`-suffixed sibling when one exists.
fn script_path(resolved: &Path, raw: &str) -> PathBuf {
    if raw.ends_with(".py") {
        return absolutize(resolved);
    }
    let with_py = append_py(resolved);
    if with_py.is_file() {
        return absolutize(&with_py);
    }
    absolutize(resolved)
}

/// "Did this file declare itself runnable?" A script needs an explicit
/// interpreter when it lacks execute permission, or when its first ten
/// lines carry no python shebang and its name ends in `.py`.
fn needs_interpreter(script: &Path) -> bool {
    if !is_executable(script) {
        return true;
    }
    !has_python_shebang(script) && script.extension().is_some_and(|ext| ext == "py")
}

fn append_py(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".py");
    PathBuf::from(name)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

fn has_python_shebang(script: &Path) -> bool {
    let Ok(file) = std::fs::File::open(script) else {
        return false;
    };
    let marker = Regex::new(r"#!.*python").expect("regex for python shebang");
    BufReader::new(file)
        .lines()
        .take(SHEBANG_PROBE_LINES)
        .map_while(Result::ok)
        .any(|line| marker.is_match(&line))
}
