//! Boundary to the platform's process-naming/discovery service.
//!
//! Server startup ordering is enforced by polling this service, not by any
//! in-process synchronization: a dependent server is only spawned once its
//! prerequisite has registered itself.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub trait NamingService {
    /// Is `name` currently registered?
    fn resolve(&self, name: &str) -> bool;

    /// Poll until `name` registers or the deadline passes.
    fn wait_registered(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.resolve(name) {
                tracing::debug!(name, "registered in naming service");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("server did not register in naming service: {name}");
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Resolves names by invoking the platform's external resolver binary; a
/// zero exit status means the name is registered.
pub struct OrbNamingService {
    resolver: PathBuf,
}

impl OrbNamingService {
    pub const RESOLVER_BINARY: &'static str = "helios_ns_resolve";

    pub fn locate() -> Result<Self> {
        let resolver = which::which(Self::RESOLVER_BINARY)
            .map_err(|err| anyhow::anyhow!("{}: {err}", Self::RESOLVER_BINARY))?;
        Ok(Self { resolver })
    }
}

impl NamingService for OrbNamingService {
    fn resolve(&self, name: &str) -> bool {
        Command::new(&self.resolver)
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStub {
        ready_after: usize,
        calls: AtomicUsize,
    }

    impl NamingService for CountingStub {
        fn resolve(&self, _name: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    #[test]
    fn wait_returns_once_registered() {
        let stub = CountingStub {
            ready_after: 3,
            calls: AtomicUsize::new(0),
        };
        stub.wait_registered("/Registry", Duration::from_secs(5))
            .expect("registers on third poll");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn wait_times_out_when_never_registered() {
        let stub = CountingStub {
            ready_after: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        let err = stub
            .wait_registered("/Study", Duration::from_millis(10))
            .unwrap_err();
        assert!(err.to_string().contains("/Study"));
    }
}
