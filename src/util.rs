use regex::Regex;
use std::path::{Path, PathBuf};

/// Platform path-list separator (`:` on unix, `;` on windows).
pub const PATH_SEP: char = if cfg!(windows) { ';' } else { ':' };
pub const PATH_SEP_STR: &str = if cfg!(windows) { ";" } else { ":" };

/// Expand a leading `~` to the user's home directory.
pub fn expand_user(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Canonicalize when the path exists, otherwise anchor it to the current
/// directory without touching the filesystem.
pub fn absolutize(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Hostname truncated at the first dot, as used in omniORB config file names.
pub fn short_hostname() -> String {
    let mut buf = [0_u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]);
    name.split('.').next().unwrap_or("localhost").to_string()
}

/// Substitute `$VAR` and `${VAR}` references through `lookup`, leaving
/// unresolved references in place.
pub fn expand_vars<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("regex for variable references");
    pattern
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            lookup(name).unwrap_or_else(|| {
                caps.get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_braced_and_bare_references() {
        let lookup = |name: &str| match name {
            "ROOT" => Some("/opt/helios".to_string()),
            _ => None,
        };
        assert_eq!(expand_vars("${ROOT}/bin", lookup), "/opt/helios/bin");
        assert_eq!(expand_vars("$ROOT/bin", lookup), "/opt/helios/bin");
    }

    #[test]
    fn unresolved_references_are_left_in_place() {
        assert_eq!(expand_vars("$MISSING/bin", |_| None), "$MISSING/bin");
    }

    #[test]
    fn tilde_expansion_prefixes_home() {
        let expanded = expand_user("~/work");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("work"));
        }
        assert_eq!(expand_user("/abs/path"), PathBuf::from("/abs/path"));
    }
}
