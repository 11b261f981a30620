//! Sandboxed execution environments.
//!
//! The executor acquires a scoped [`Sandbox`] per action: a private root
//! directory where declared inputs are materialized and declared outputs
//! are collected, plus whatever process-level confinement the platform
//! offers. Release is idempotent and runs on every exit path (including
//! drop), so a panicking worker never leaks a sandbox.
//!
//! Backends:
//! - Linux: user+network namespaces via `unshare(2)` when the policy denies
//!   network, plus rlimits. Namespace setup is best-effort: containers
//!   commonly disable unprivileged user namespaces, and a build that runs
//!   unconfined is preferable to one that cannot run at all.
//! - macOS: the command is wrapped in `sandbox-exec` with a generated
//!   profile scoping writes to the sandbox root.
//! - Anywhere else: directory isolation only.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use tracing::{debug, trace};

use crate::action::ResourceLimits;

/// Network access policy for an action.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum NetworkPolicy {
    /// Hermetic: no network. The default.
    #[default]
    Deny,
    /// The action may reach the network (e.g. explicitly-declared fetches).
    Allow,
}

/// What an action is allowed to see and do.
#[derive(Clone, Debug, Default, Builder)]
pub struct SandboxSpec {
    /// Environment visible inside the sandbox. Nothing else leaks in.
    #[builder(default)]
    pub env: BTreeMap<String, String>,
    #[builder(default)]
    pub network: NetworkPolicy,
    #[builder(default)]
    pub limits: ResourceLimits,
}

/// A scoped execution environment.
pub trait Sandbox: Send {
    /// The private root directory; inputs are materialized and outputs
    /// collected relative to it.
    fn root(&self) -> &Path;

    /// Rewrite the command vector for confinement wrappers (e.g.
    /// `sandbox-exec` on macOS). Identity on platforms that confine via
    /// process attributes instead.
    fn wrap(&self, command: Vec<String>) -> Vec<String> {
        command
    }

    /// Apply working directory, environment, and resource limits to the
    /// command about to spawn.
    fn configure(&self, command: &mut std::process::Command) -> Result<()>;

    /// Tear the sandbox down. Idempotent; also invoked on drop.
    fn release(&mut self) -> Result<()>;
}

/// Opens sandboxes for the executor.
pub trait SandboxProvider: Send + Sync {
    fn enter(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>>;
}

/// The platform-native provider.
#[derive(Debug, Default)]
pub struct NativeSandboxProvider;

impl SandboxProvider for NativeSandboxProvider {
    fn enter(&self, spec: SandboxSpec) -> Result<Box<dyn Sandbox>> {
        let dir = tempfile::Builder::new()
            .prefix("forge-sandbox.")
            .tempdir()
            .context("create sandbox root")?;
        trace!(root = ?dir.path(), "entered sandbox");
        Ok(Box::new(DirSandbox {
            dir: Some(dir),
            root: PathBuf::new(),
            spec,
        }))
    }
}

/// Directory-rooted sandbox with per-OS confinement.
struct DirSandbox {
    dir: Option<tempfile::TempDir>,
    /// Retained after release so `root()` stays callable on every path.
    root: PathBuf,
    spec: SandboxSpec,
}

impl Sandbox for DirSandbox {
    fn root(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => &self.root,
        }
    }

    #[cfg(target_os = "macos")]
    fn wrap(&self, command: Vec<String>) -> Vec<String> {
        // Scoped profile: writes only under the sandbox root, network per
        // policy.
        let mut profile = String::from("(version 1)\n(allow default)\n");
        profile.push_str(&format!(
            "(deny file-write* (subpath \"/\"))\n(allow file-write* (subpath {:?}))\n",
            self.root()
        ));
        if self.spec.network == NetworkPolicy::Deny {
            profile.push_str("(deny network*)\n");
        }

        let mut wrapped = vec![
            "sandbox-exec".to_string(),
            "-p".to_string(),
            profile,
        ];
        wrapped.extend(command);
        wrapped
    }

    fn configure(&self, command: &mut std::process::Command) -> Result<()> {
        command.current_dir(self.root());
        command.env_clear();
        // A bare PATH so handlers and shells resolve; everything else comes
        // from the declared environment.
        command.env("PATH", std::env::var("PATH").unwrap_or_default());
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;

            let limits = self.spec.limits;
            let deny_network = self.spec.network == NetworkPolicy::Deny;
            // SAFETY: the closure runs post-fork pre-exec and only calls
            // async-signal-safe libc functions.
            unsafe {
                command.pre_exec(move || {
                    if deny_network {
                        // Best effort: requires unprivileged user
                        // namespaces; ignore failure rather than refuse to
                        // build.
                        let _ = libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);
                    }
                    set_rlimit(libc::RLIMIT_CPU, limits.cpu_secs)?;
                    set_rlimit(libc::RLIMIT_AS, limits.memory_bytes)?;
                    set_rlimit(libc::RLIMIT_FSIZE, limits.file_size_bytes)?;
                    Ok(())
                });
            }
        }

        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            self.root = dir.path().to_path_buf();
            dir.close().context("remove sandbox root")?;
            debug!(root = ?self.root, "released sandbox");
        }
        Ok(())
    }
}

impl Drop for DirSandbox {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(target_os = "linux", not(target_env = "gnu")))]
type RlimitResource = libc::c_int;

#[cfg(target_os = "linux")]
fn set_rlimit(resource: RlimitResource, limit: Option<u64>) -> std::io::Result<()> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let rlimit = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: plain syscall with a stack-local struct.
    if unsafe { libc::setrlimit(resource, &rlimit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn sandbox_root_is_private_and_released() {
        let provider = NativeSandboxProvider;
        let mut sandbox = provider.enter(SandboxSpec::default()).unwrap();
        let root = sandbox.root().to_path_buf();
        assert!(root.exists());

        std::fs::write(root.join("scratch"), b"data").unwrap();
        sandbox.release().unwrap();
        assert!(!root.exists());

        // Idempotent.
        sandbox.release().unwrap();
        pretty_assert_eq!(sandbox.root(), root.as_path());
    }

    #[test]
    fn configure_scrubs_environment() {
        let provider = NativeSandboxProvider;
        let spec = SandboxSpec::builder()
            .env([("ONLY_THIS".to_string(), "1".to_string())].into())
            .build();
        let sandbox = provider.enter(spec).unwrap();

        let mut command = std::process::Command::new("env");
        sandbox.configure(&mut command).unwrap();
        let output = command.output().unwrap();
        let env = String::from_utf8_lossy(&output.stdout);

        assert!(env.contains("ONLY_THIS=1"));
        assert!(env.lines().all(|line| {
            line.starts_with("PATH=") || line.starts_with("ONLY_THIS=") || line.is_empty()
                // pre_exec confinement may add nothing, but some shells
                // export PWD/SHLVL themselves; `env` itself does not.
                || line.starts_with("PWD=")
        }));
    }

    #[test]
    fn command_runs_inside_root() {
        let provider = NativeSandboxProvider;
        let sandbox = provider.enter(SandboxSpec::default()).unwrap();

        let mut command = std::process::Command::new("sh");
        command.args(["-c", "echo -n test > created.txt"]);
        sandbox.configure(&mut command).unwrap();
        let status = command.status().unwrap();
        assert!(status.success());
        pretty_assert_eq!(
            std::fs::read(sandbox.root().join("created.txt")).unwrap(),
            b"test".to_vec()
        );
    }
}
