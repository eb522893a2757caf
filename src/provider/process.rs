//! Subprocess backend.
//!
//! Each attempt runs the configured command as a child process: the call's
//! argument bytes go to stdin and stdout becomes the return value. A
//! non-zero exit is a user error carrying stderr, death by signal is treated
//! like a worker killed for exceeding its memory limit.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{
    resource_name, with_rollback, Backend, CleanupOptions, CostBreakdown, Mode, Pricing, Provider,
};
use crate::gc::DirectoryInventory;
use crate::invoke::{Call, FunctionStats, RemoteError, Return};
use crate::types::{Error, ErrorKind, InstanceId, Result, RuntimeOptions};

/// Environment variable naming the function a child should run.
pub const FUNCTION_ENV: &str = "FAAST_FUNCTION";
/// Environment variable carrying the call id.
pub const CALL_ID_ENV: &str = "FAAST_CALL_ID";
/// Environment variable carrying the configured memory size.
pub const MEMORY_LIMIT_ENV: &str = "FAAST_MEMORY_LIMIT_MB";

const MANIFEST_FILE: &str = "command.json";

/// Command a subprocess worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Runs calls as child processes inside a per-instance working directory.
#[derive(Debug)]
pub struct ProcessBackend {
    instance_id: InstanceId,
    command: ProcessCommand,
    workdir: PathBuf,
    timeout: Duration,
    memory_size_mb: u32,
    pricing: Pricing,
}

impl ProcessBackend {
    pub fn new(
        command: ProcessCommand,
        workdir: impl Into<PathBuf>,
        instance_id: InstanceId,
        options: &RuntimeOptions,
    ) -> Self {
        Self {
            instance_id,
            command,
            workdir: workdir.into(),
            timeout: options.timeout,
            memory_size_mb: options.memory_size_mb,
            pricing: Pricing::FREE,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn command_for(&self, call: &Call) -> Command {
        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .env(FUNCTION_ENV, &call.function_name)
            .env(CALL_ID_ENV, call.call_id.as_str())
            .env(MEMORY_LIMIT_ENV, self.memory_size_mb.to_string())
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn exit_failure(function_name: &str, status: ExitStatus, stderr: &[u8]) -> RemoteError {
    let error = match status.code() {
        Some(code) => RemoteError::new(
            ErrorKind::User,
            format!("{function_name} exited with status {code}"),
        ),
        None => RemoteError::new(
            ErrorKind::OutOfMemory,
            format!("{function_name} was killed ({status})"),
        ),
    };
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        error
    } else {
        error.with_stack(stderr)
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn mode(&self) -> Mode {
        Mode::Direct
    }

    async fn invoke(&self, call: &Call, cancel: &CancellationToken) -> Result<Option<Return>> {
        let mut child = self.command_for(call).spawn().map_err(|err| {
            Error::infrastructure(format!(
                "failed to start {}: {}",
                self.command.program.display(),
                err
            ))
            .with_cause(err)
        })?;
        let start = Utc::now();
        tracing::trace!(
            "process_spawned: call_id={}, pid={:?}",
            call.call_id,
            child.id()
        );

        if let Some(mut stdin) = child.stdin.take() {
            let args = call.args.clone();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&args).await {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        tracing::debug!("process_stdin_failed: error={}", err);
                    }
                }
            });
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            output = tokio::time::timeout(self.timeout, child.wait_with_output()) => output,
        };
        let end = Utc::now();

        let ret = match output {
            Err(_) => Return::failure(
                call.call_id.clone(),
                RemoteError::new(
                    ErrorKind::Timeout,
                    format!("{} exceeded its {:?} timeout", call.function_name, self.timeout),
                ),
            ),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(output)) if output.status.success() => {
                Return::success(call.call_id.clone(), Bytes::from(output.stdout))
            }
            Ok(Ok(output)) => Return::failure(
                call.call_id.clone(),
                exit_failure(&call.function_name, output.status, &output.stderr),
            ),
        };
        Ok(Some(Return {
            instance_id: Some(resource_name(&self.instance_id)),
            ..ret.with_timing(start, end)
        }))
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<()> {
        if !options.delete_resources {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn cost_snapshot(&self, stats: &FunctionStats) -> CostBreakdown {
        self.pricing.breakdown(stats, self.memory_size_mb)
    }
}

/// Provider for [`ProcessBackend`]. Working directories live under `base`.
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    base: PathBuf,
}

impl ProcessProvider {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Inventory of the working directories this provider creates.
    pub fn inventory(&self) -> DirectoryInventory {
        DirectoryInventory::new(&self.base)
    }
}

#[async_trait]
impl Provider for ProcessProvider {
    type Module = ProcessCommand;
    type Backend = ProcessBackend;

    fn name(&self) -> &str {
        "process"
    }

    async fn initialize(
        &self,
        module: ProcessCommand,
        instance_id: &InstanceId,
        options: &RuntimeOptions,
    ) -> Result<ProcessBackend> {
        let workdir = self.base.join(resource_name(instance_id));
        let create = async {
            tokio::fs::create_dir_all(&workdir).await?;
            let manifest = serde_json::to_vec_pretty(&module)?;
            tokio::fs::write(workdir.join(MANIFEST_FILE), manifest).await?;
            if module.program.as_os_str().is_empty() {
                return Err(Error::validation("process command has no program"));
            }
            Ok(())
        };
        let created = &workdir;
        with_rollback(create, move || async move {
            match tokio::fs::remove_dir_all(created).await {
                Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            }
        })
        .await?;

        tracing::info!(
            "process_backend_initialized: instance_id={}, workdir={}",
            instance_id,
            workdir.display()
        );
        Ok(ProcessBackend::new(module, workdir, instance_id.clone(), options))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessCommand {
        ProcessCommand::new("/bin/sh").arg("-c").arg(script)
    }

    fn backend(command: ProcessCommand, dir: &Path, timeout: Duration) -> ProcessBackend {
        let options = RuntimeOptions {
            timeout,
            ..RuntimeOptions::default()
        };
        ProcessBackend::new(command, dir, InstanceId::new(), &options)
    }

    async fn run(backend: &ProcessBackend, name: &str, args: &'static [u8]) -> Return {
        backend
            .invoke(
                &Call::new(name, Bytes::from_static(args)),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_stdin_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(sh("cat"), dir.path(), Duration::from_secs(10));
        let ret = run(&backend, "echo", b"[2,3]").await;
        assert_eq!(ret.into_result().unwrap(), Bytes::from_static(b"[2,3]"));
    }

    #[tokio::test]
    async fn test_call_environment() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            sh("printf '%s:%s' \"$FAAST_FUNCTION\" \"$FAAST_MEMORY_LIMIT_MB\""),
            dir.path(),
            Duration::from_secs(10),
        );
        let ret = run(&backend, "add", b"").await;
        let expected = format!("add:{}", RuntimeOptions::default().memory_size_mb);
        assert_eq!(ret.into_result().unwrap(), Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(sh("echo boom >&2; exit 3"), dir.path(), Duration::from_secs(10));
        let ret = run(&backend, "fail", b"").await;
        let remote = ret.remote_error().unwrap();
        assert_eq!(remote.kind, ErrorKind::User);
        assert!(remote.message.contains("status 3"));
        assert_eq!(remote.stack.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_killed_by_signal_is_out_of_memory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(sh("kill -9 $$"), dir.path(), Duration::from_secs(10));
        let ret = run(&backend, "hog", b"").await;
        assert_eq!(ret.remote_error().unwrap().kind, ErrorKind::OutOfMemory);
    }

    #[tokio::test]
    async fn test_slow_child_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(sh("sleep 10"), dir.path(), Duration::from_millis(200));
        let ret = run(&backend, "slow", b"").await;
        assert_eq!(ret.remote_error().unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_missing_program_is_infrastructure_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            ProcessCommand::new("/nonexistent/faast-worker"),
            dir.path(),
            Duration::from_secs(1),
        );
        let err = backend
            .invoke(&Call::new("f", Bytes::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }

    #[tokio::test]
    async fn test_initialize_and_cleanup_workdir() {
        let base = tempfile::tempdir().unwrap();
        let provider = ProcessProvider::new(base.path());
        let id = InstanceId::new();
        let backend = provider
            .initialize(sh("cat"), &id, &RuntimeOptions::default())
            .await
            .unwrap();
        assert!(backend.workdir().join(MANIFEST_FILE).exists());
        assert!(backend.workdir().ends_with(resource_name(&id)));

        backend.cleanup(CleanupOptions::default()).await.unwrap();
        assert!(!backend.workdir().exists());
        backend.cleanup(CleanupOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_initialize_rolls_back() {
        let base = tempfile::tempdir().unwrap();
        let provider = ProcessProvider::new(base.path());
        let id = InstanceId::new();
        let err = provider
            .initialize(ProcessCommand::new(""), &id, &RuntimeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(!base.path().join(resource_name(&id)).exists());
    }
}
