//! Xray-core process supervisor.
//!
//! The engine outlives the invocation that started it, so state is kept on
//! disk next to the binary and any later invocation can find it again.
//!
//! # Lifecycle
//! ```text
//! EngineSupervisor::start()
//!   → binary missing?        BinaryMissing
//!   → live PID recorded?     AlreadyRunning (nothing spawned)
//!   → spawn `xray run -config config.json`, output appended to xray.log
//!   → write PID to xray.pid (child killed if that fails)
//!
//! EngineSupervisor::stop()
//!   → kill the child we spawned, or the PID from xray.pid
//!   → remove xray.pid
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use super::error::{ProcessError, ProxyError, Result};
use super::process::{ProcessRegistry, SystemRegistry};

/// Files the engine runs from. All live next to the binary by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl EnginePaths {
    /// `config.json`, `xray.pid` and `xray.log` in the binary's directory.
    pub fn for_binary(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let dir = binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config: dir.join("config.json"),
            pid_file: dir.join("xray.pid"),
            log_file: dir.join("xray.log"),
            binary,
        }
    }
}

/// Handle to the engine process, whether spawned here or by an earlier run.
pub struct EngineSupervisor<R = SystemRegistry> {
    paths: EnginePaths,
    registry: R,
    /// Set only when this instance spawned the engine.
    child: Option<tokio::process::Child>,
}

impl EngineSupervisor<SystemRegistry> {
    pub fn new(paths: EnginePaths) -> Self {
        Self::with_registry(paths, SystemRegistry)
    }
}

impl<R: ProcessRegistry> EngineSupervisor<R> {
    pub fn with_registry(paths: EnginePaths, registry: R) -> Self {
        Self {
            paths,
            registry,
            child: None,
        }
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    /// Start the engine with the config at `paths.config`.
    ///
    /// The process is not tied to this handle: dropping the supervisor or
    /// exiting the program leaves it running.
    ///
    /// # Errors
    /// - `BinaryMissing` when the binary has not been installed
    /// - `AlreadyRunning` when a live engine is recorded, without spawning
    /// - `Spawn` / `PidFile` when the process cannot be started or tracked
    pub async fn start(&mut self) -> Result<u32> {
        if !self.paths.binary.exists() {
            return Err(ProcessError::BinaryMissing(self.paths.binary.clone()).into());
        }
        if let Some(pid) = self.running_pid() {
            return Err(ProcessError::AlreadyRunning(pid).into());
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.log_file)
            .map_err(|e| ProxyError::io(&self.paths.log_file, e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| ProxyError::io(&self.paths.log_file, e))?;

        let mut child = tokio::process::Command::new(&self.paths.binary)
            .arg("run")
            .arg("-config")
            .arg(&self.paths.config)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(ProcessError::Spawn)?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::Spawn(std::io::Error::other(
                "engine exited before its PID could be read",
            ))
            .into());
        };

        if let Err(source) = std::fs::write(&self.paths.pid_file, pid.to_string()) {
            if let Err(e) = child.start_kill() {
                tracing::warn!("failed to kill untracked engine {pid}: {e}");
            }
            return Err(ProcessError::PidFile {
                path: self.paths.pid_file.clone(),
                source,
            }
            .into());
        }

        tracing::info!(
            "xray-core started (PID {pid}), logs at {}",
            self.paths.log_file.display()
        );
        self.child = Some(child);
        Ok(pid)
    }

    /// Stop the engine if one is recorded. Always clears the PID file.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill xray-core: {e}");
            }
        } else if let Some(pid) = self.read_pid() {
            if let Err(e) = self.registry.terminate(pid) {
                tracing::info!("process {pid} may have already stopped: {e}");
            }
        }

        match std::fs::remove_file(&self.paths.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ProxyError::io(&self.paths.pid_file, e)),
        }
        tracing::info!("xray-core stopped");
        Ok(())
    }

    pub fn is_running(&mut self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the live engine, if any.
    pub fn running_pid(&mut self) -> Option<u32> {
        if let Some(child) = self.child.as_mut() {
            return match child.try_wait() {
                Ok(None) => child.id(),
                _ => None,
            };
        }
        let pid = self.read_pid()?;
        self.registry.is_alive(pid).then_some(pid)
    }

    /// PID recorded on disk. Missing or unparsable files read as `None`.
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.paths.pid_file)
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0)
    }
}
