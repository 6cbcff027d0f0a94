//! Subprocess execution behind a trait so the modules that drive `ip` and
//! `wg` can be unit-tested without touching real system networking.

use anyhow::{anyhow, Result};
use std::process::Command;

/// Executes external commands. Production code uses [`OsRunner`]; tests
/// substitute a recording implementation with canned output.
pub trait Runner: Send + Sync {
    fn run(&self, name: &str, args: &[&str]) -> Result<()>;
    fn output(&self, name: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands on the host.
pub struct OsRunner;

impl Runner for OsRunner {
    fn run(&self, name: &str, args: &[&str]) -> Result<()> {
        let out = Command::new(name)
            .args(args)
            .output()
            .map_err(|e| anyhow!("exec {name}: {e}"))?;
        if !out.status.success() {
            let msg = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if msg.is_empty() {
                return Err(anyhow!("{name} exited with {}", out.status));
            }
            return Err(anyhow!("{name} exited with {}: {msg}", out.status));
        }
        Ok(())
    }

    fn output(&self, name: &str, args: &[&str]) -> Result<String> {
        let out = Command::new(name)
            .args(args)
            .output()
            .map_err(|e| anyhow!("exec {name}: {e}"))?;
        if !out.status.success() {
            let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(anyhow!("{}", combined.trim()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}
