//! Expansion of `--config=` / `--extra_env=` options into concrete context
//! file paths.

use crate::envdiff::{self, EnvMap};
use crate::util::{absolutize, expand_user};
use anyhow::Result;
use std::path::{Path, PathBuf};

pub const CONFIG_PREFIX: &str = "--config=";
pub const EXTRA_ENV_PREFIX: &str = "--extra_env=";

/// Result of scanning an argument list for one option prefix.
#[derive(Debug, Default)]
pub struct ResolvedConfigs {
    /// Resolved absolute paths, in first-discovery order.
    pub files: Vec<PathBuf>,
    /// The argument list with the matched option tokens removed.
    pub remaining_args: Vec<String>,
    /// Paths that were requested but do not exist. Surfaced to the caller;
    /// never auto-corrected.
    pub missing: Vec<PathBuf>,
}

/// Everything the CLI needs from the configuration options of one
/// invocation: context files, the extra environment contributed by
/// `--extra_env=` files, and the argument stream with both option families
/// removed.
#[derive(Debug)]
pub struct GatheredConfig {
    pub files: Vec<PathBuf>,
    pub extra_env: EnvMap,
    pub remaining_args: Vec<String>,
    pub missing: Vec<PathBuf>,
}

/// Scan `args` for tokens starting with `option_prefix` and expand their
/// comma-separated suffixes into concrete file paths.
///
/// Directory fragments expand recursively into the `.cfg` files they
/// contain, plus any `.sh` file lacking a same-named `.cfg` sibling.
/// Traversal order within a directory is inherited from the filesystem.
pub fn resolve_config_files(
    args: &[String],
    option_prefix: &str,
    check_existence: bool,
) -> ResolvedConfigs {
    let mut resolved = ResolvedConfigs::default();
    let mut lists = Vec::new();
    for arg in args {
        match arg.strip_prefix(option_prefix) {
            Some(rest) => lists.push(rest.to_string()),
            None => resolved.remaining_args.push(arg.clone()),
        }
    }

    for list in lists {
        for fragment in list.split(',') {
            if fragment.is_empty() {
                continue;
            }
            let path = absolutize(&expand_user(fragment));
            if path.is_dir() {
                list_directory(&path, &mut resolved.files);
            } else if check_existence && !path.is_file() {
                resolved.missing.push(path);
            } else {
                resolved.files.push(path);
            }
        }
    }
    resolved
}

/// Context files of the virtual application: the `env.d` directory under
/// `$HELIOS_APPLI_PATH`, when it exists.
pub fn default_config_files() -> Vec<PathBuf> {
    let appli = match std::env::var("HELIOS_APPLI_PATH") {
        Ok(value) if !value.is_empty() => value,
        _ => return Vec::new(),
    };
    let envd = Path::new(&appli).join("env.d");
    if !envd.is_dir() {
        return Vec::new();
    }
    let mut files = Vec::new();
    list_directory(&envd, &mut files);
    files
}

/// Resolve both option families from a raw argument stream and compute the
/// extra environment contributed by the `--extra_env=` files.
pub fn gather(args: &[String]) -> Result<GatheredConfig> {
    let has_config = args.iter().any(|arg| arg.starts_with(CONFIG_PREFIX));
    let (files, args, mut missing) = if has_config {
        let configs = resolve_config_files(args, CONFIG_PREFIX, true);
        (configs.files, configs.remaining_args, configs.missing)
    } else {
        (default_config_files(), args.to_vec(), Vec::new())
    };

    let extra = resolve_config_files(&args, EXTRA_ENV_PREFIX, true);
    missing.extend(extra.missing);
    let extra_env = envdiff::extra_environment(&extra.files)?;

    Ok(GatheredConfig {
        files,
        extra_env,
        remaining_args: extra.remaining_args,
        missing,
    })
}

fn list_directory(dir: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut subdirs = Vec::new();
    let mut sh_files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.extension().is_some_and(|ext| ext == "cfg") {
            found.push(path);
        } else if path.extension().is_some_and(|ext| ext == "sh") {
            sh_files.push(path);
        }
    }
    // a .sh file is a legacy fallback; its .cfg sibling wins when present
    for sh in sh_files {
        if !sh.with_extension("cfg").is_file() {
            found.push(sh);
        }
    }
    for subdir in subdirs {
        list_directory(&subdir, found);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn splits_comma_lists_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let existing = dir.path().join("a.cfg");
        fs::write(&existing, "X=1\n").expect("write");
        let missing = dir.path().join("b.cfg");

        let args = vec![
            format!("--config={},{}", existing.display(), missing.display()),
            "start".to_string(),
        ];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, true);

        assert_eq!(resolved.files, vec![existing.canonicalize().expect("canon")]);
        assert_eq!(resolved.missing, vec![missing]);
        assert_eq!(resolved.remaining_args, vec!["start".to_string()]);
    }

    #[test]
    fn missing_files_kept_when_existence_not_checked() {
        let args = vec!["--config=/nonexistent/helios.cfg".to_string()];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, false);
        assert_eq!(resolved.files.len(), 1);
        assert!(resolved.missing.is_empty());
    }

    #[test]
    fn directory_expansion_prefers_cfg_over_sh_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("x.cfg"), "").expect("write");
        fs::write(dir.path().join("y.sh"), "").expect("write");
        fs::write(dir.path().join("y.cfg"), "").expect("write");

        let args = vec![format!("--config={}", dir.path().display())];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, true);

        let names: Vec<String> = resolved
            .files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"x.cfg".to_string()));
        assert!(names.contains(&"y.cfg".to_string()));
        assert!(!names.contains(&"y.sh".to_string()));
    }

    #[test]
    fn directory_expansion_recurses_and_keeps_lone_sh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).expect("mkdir");
        fs::write(nested.join("legacy.sh"), "").expect("write");

        let args = vec![format!("--config={}", dir.path().display())];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, true);
        let names: Vec<String> = resolved
            .files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["legacy.sh".to_string()]);
    }

    #[test]
    fn token_order_precedes_comma_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("first.cfg");
        let second = dir.path().join("second.cfg");
        fs::write(&first, "").expect("write");
        fs::write(&second, "").expect("write");

        let args = vec![
            format!("--config={}", second.display()),
            format!("--config={}", first.display()),
        ];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, true);
        let names: Vec<String> = resolved
            .files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["second.cfg".to_string(), "first.cfg".to_string()]);
    }

    #[test]
    fn unrelated_prefixes_stay_in_remaining_args() {
        let args = vec![
            "--extra_env=/tmp/e.sh".to_string(),
            "script.py".to_string(),
        ];
        let resolved = resolve_config_files(&args, CONFIG_PREFIX, true);
        assert!(resolved.files.is_empty());
        assert_eq!(resolved.remaining_args, args);
    }
}
