//! Context file parsing.
//!
//! `.cfg` files are line-oriented `KEY=VALUE` with `#` comments, an
//! optional `[section]` header line, and an `unset=A,B` directive. Keys in
//! the reserved set carry comma-separated path lists. Legacy `.sh` files
//! are not parsed at all; they go through the environment snapshot differ.

use crate::envdiff;
use crate::util::PATH_SEP;
use anyhow::{Context as _, Result};
use std::path::Path;
use thiserror::Error;

/// Variables that accumulate path lists across merged context files instead
/// of being overwritten.
pub const RESERVED: &[&str] = &[
    "PATH",
    "LD_LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "PYTHONPATH",
    "MANPATH",
    "PV_PLUGIN_PATH",
    "INCLUDE",
    "LIBPATH",
    "HELIOS_PLUGINS_PATH",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// `INCLUDE` and `LIBPATH` are consumed by tools that expect
/// space-separated lists; everything else joins with the path separator.
pub fn separator_for(name: &str) -> &'static str {
    if name == "INCLUDE" || name == "LIBPATH" {
        " "
    } else {
        crate::util::PATH_SEP_STR
    }
}

/// Parsed content of one context file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ContextFile {
    pub unset: Vec<String>,
    /// Plain assignments, in file order.
    pub vars: Vec<(String, String)>,
    /// Reserved-variable path lists, in file order.
    pub reserved: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Error)]
pub enum CfgParseError {
    #[error("{path}:{line}: expected KEY=VALUE, found {text:?}")]
    Malformed {
        path: String,
        line: usize,
        text: String,
    },
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn parse_cfg(path: &Path) -> Result<ContextFile, CfgParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| CfgParseError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut file = ContextFile::default();
    for (number, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // section headers carry no data of their own
        if line.starts_with('[') && line.ends_with(']') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(CfgParseError::Malformed {
                path: path.display().to_string(),
                line: number + 1,
                text: raw.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("unset") {
            file.unset.extend(
                value
                    .split(',')
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
            );
        } else if is_reserved(key) {
            let elements = value
                .split(',')
                .map(str::trim)
                .filter(|element| !element.is_empty())
                .map(String::from)
                .collect();
            file.reserved.push((key.to_string(), elements));
        } else {
            file.vars.push((key.to_string(), value.to_string()));
        }
    }
    Ok(file)
}

/// Convert a legacy `.sh` environment file by sourcing it in a subprocess
/// and diffing the resulting environment against a baseline snapshot. Only
/// a failure to spawn the probe propagates.
pub fn convert_sh(path: &Path) -> Result<ContextFile> {
    let diff = envdiff::extra_environment(&[path.to_path_buf()])?;
    let mut file = ContextFile::default();
    for (key, value) in diff {
        if is_reserved(&key) {
            let elements = value.split(PATH_SEP).map(String::from).collect();
            file.reserved.push((key, elements));
        } else {
            file.vars.push((key, value));
        }
    }
    Ok(file)
}

/// Load a context file by extension. A file that fails to parse gets one
/// repair attempt through a same-named sibling of the other known
/// extension; a second failure is fatal. Unrecognized extensions are
/// skipped with a warning.
pub fn load(path: &Path) -> Result<ContextFile> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("cfg") => match parse_cfg(path) {
            Ok(file) => Ok(file),
            Err(err) => repair_with_sibling(path, "sh", anyhow::Error::new(err)),
        },
        Some("sh") => match convert_sh(path) {
            Ok(file) => Ok(file),
            Err(err) => repair_with_sibling(path, "cfg", err),
        },
        _ => {
            tracing::warn!(
                path = %path.display(),
                "unrecognized extension for context file; skipping"
            );
            Ok(ContextFile::default())
        }
    }
}

fn repair_with_sibling(path: &Path, extension: &str, err: anyhow::Error) -> Result<ContextFile> {
    let sibling = path.with_extension(extension);
    if !sibling.is_file() {
        return Err(err.context(format!("parse context file {}", path.display())));
    }
    tracing::warn!(
        path = %path.display(),
        sibling = %sibling.display(),
        error = %err,
        "context file failed to parse; retrying with its sibling"
    );
    let repaired = match extension {
        "sh" => convert_sh(&sibling),
        _ => parse_cfg(&sibling).map_err(anyhow::Error::new),
    };
    repaired.with_context(|| {
        format!(
            "parse context file {} (and its sibling {})",
            path.display(),
            sibling.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_vars_reserved_and_unset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ctx.cfg");
        fs::write(
            &path,
            "[Helios Configuration]\n\
             # module roots\n\
             GEOM_ROOT_DIR=/opt/helios/geom\n\
             PYTHONPATH=/opt/helios/geom/python, /opt/helios/kernel/python\n\
             unset=STALE_VAR\n",
        )
        .expect("write");

        let file = parse_cfg(&path).expect("parse");
        assert_eq!(
            file.vars,
            vec![("GEOM_ROOT_DIR".to_string(), "/opt/helios/geom".to_string())]
        );
        assert_eq!(file.unset, vec!["STALE_VAR".to_string()]);
        assert_eq!(file.reserved.len(), 1);
        let (name, elements) = &file.reserved[0];
        assert_eq!(name, "PYTHONPATH");
        assert_eq!(elements.len(), 2);
    }

    #[test]
    fn malformed_line_reports_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.cfg");
        fs::write(&path, "GOOD=1\nthis line has no separator\n").expect("write");

        let err = parse_cfg(&path).unwrap_err();
        match err {
            CfgParseError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sh_files_convert_through_the_differ() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.sh");
        fs::write(&path, "export HELIOS_CFG_TEST_ONLY=converted\n").expect("write");

        let file = load(&path).expect("convert");
        assert!(file
            .vars
            .iter()
            .any(|(k, v)| k == "HELIOS_CFG_TEST_ONLY" && v == "converted"));
    }

    #[test]
    fn broken_cfg_repairs_through_sh_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = dir.path().join("env.cfg");
        fs::write(&cfg, "no separator at all\n").expect("write");
        fs::write(
            dir.path().join("env.sh"),
            "export HELIOS_REPAIR_TEST_ONLY=yes\n",
        )
        .expect("write");

        let file = load(&cfg).expect("repair");
        assert!(file
            .vars
            .iter()
            .any(|(k, _)| k == "HELIOS_REPAIR_TEST_ONLY"));
    }

    #[test]
    fn broken_sh_repairs_through_cfg_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sh = dir.path().join("env.sh");
        fs::write(&sh, "export IGNORED=1\n").expect("write");
        fs::write(dir.path().join("env.cfg"), "HELIOS_SH_REPAIR_TEST=yes\n").expect("write");

        // conversion failures only happen when the probe cannot spawn, so
        // drive the repair step directly with a synthetic failure
        let file = repair_with_sibling(&sh, "cfg", anyhow::anyhow!("conversion failed"))
            .expect("repair");
        assert!(file
            .vars
            .iter()
            .any(|(k, v)| k == "HELIOS_SH_REPAIR_TEST" && v == "yes"));
    }

    #[test]
    fn broken_sh_without_sibling_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sh = dir.path().join("orphan.sh");
        fs::write(&sh, "export IGNORED=1\n").expect("write");
        assert!(repair_with_sibling(&sh, "cfg", anyhow::anyhow!("conversion failed")).is_err());
    }

    #[test]
    fn broken_cfg_without_sibling_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = dir.path().join("orphan.cfg");
        fs::write(&cfg, "still no separator\n").expect("write");
        assert!(load(&cfg).is_err());
    }

    #[test]
    fn unknown_extension_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.txt");
        fs::write(&path, "whatever\n").expect("write");
        let file = load(&path).expect("skip");
        assert_eq!(file, ContextFile::default());
    }
}
