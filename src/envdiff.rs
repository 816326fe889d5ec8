//! Environment snapshot capture and diffing.
//!
//! Legacy `.sh` environment files are not parsed; they are sourced in a
//! subprocess and the resulting environment is compared against a baseline
//! snapshot. Only the variables (or path-list tokens) a file newly
//! contributes survive the diff, so several files can be composed
//! incrementally without re-exporting unchanged variables.

use crate::util::{PATH_SEP, PATH_SEP_STR};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub type EnvMap = BTreeMap<String, String>;

/// Printed by the probe shell after the command completes; output past this
/// line belongs to the command itself and is not environment data.
const SENTINEL: &str = "__helios_env_probe_done__";

/// Hard cap on consumed output lines, guarding against a runaway producer.
const MAX_LINES: usize = 1000;

/// Run `command` under `sh -c` and collect the `KEY=VALUE` lines it prints.
///
/// Reading stops at the sentinel line or after [`MAX_LINES`] lines. Lines
/// that do not split into a pair on `=` are discarded. A non-zero exit
/// still yields whatever was parsed up to the cut-off; only a failure to
/// spawn the probe at all is an error.
pub fn capture_environment(command: &str, initial_env: Option<&EnvMap>) -> Result<EnvMap> {
    let probe = format!("{command} && echo {SENTINEL}");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&probe);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    if let Some(env) = initial_env {
        cmd.env_clear();
        cmd.envs(env);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn environment probe: {command}"))?;

    let mut vars = EnvMap::new();
    if let Some(stdout) = child.stdout.take() {
        let reader = BufReader::new(stdout);
        for (count, line) in reader.lines().enumerate() {
            let Ok(line) = line else { break };
            if line.contains(SENTINEL) || count >= MAX_LINES {
                break;
            }
            let line = line.trim_end();
            if let Some((key, value)) = line.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }

    let status = child.wait().context("wait for environment probe")?;
    if !status.success() {
        tracing::debug!(
            command,
            code = status.code(),
            "environment probe exited non-zero; keeping partial snapshot"
        );
    }
    Ok(vars)
}

/// Variables present in `after` and absent from `before`, plus, for values
/// already present, the path-list tokens `after` introduces.
///
/// The token comparison is a set difference: the returned value for a
/// changed variable holds only the novel tokens, joined with the platform
/// path separator, in their order of appearance in `after`. A variable with
/// an identical value in both snapshots never appears in the result.
pub fn diff_environment(before: &EnvMap, after: &EnvMap) -> EnvMap {
    let mut diff = EnvMap::new();
    for (key, value) in after {
        let Some(known) = before.get(key) else {
            diff.insert(key.clone(), value.clone());
            continue;
        };
        let known: HashSet<&str> = known.split(PATH_SEP).collect();
        let mut seen = HashSet::new();
        let novel: Vec<&str> = value
            .split(PATH_SEP)
            .filter(|token| !known.contains(token) && seen.insert(*token))
            .collect();
        if !novel.is_empty() {
            diff.insert(key.clone(), novel.join(PATH_SEP_STR));
        }
    }
    diff
}

/// Compute the incremental environment contributed by a list of sourced
/// `.sh` files: a baseline `env` snapshot is taken, each file is sourced in
/// turn into a cumulative `after` snapshot, and the diff is returned.
pub fn extra_environment(files: &[PathBuf]) -> Result<EnvMap> {
    if files.is_empty() {
        return Ok(EnvMap::new());
    }
    let before = capture_environment("env", None)?;
    let mut after = EnvMap::new();
    for file in files {
        let quoted = shell_words::quote(&file.to_string_lossy()).into_owned();
        let command = format!(". {quoted} && env");
        after.extend(capture_environment(&command, None)?);
    }
    Ok(diff_environment(&before, &after))
}
