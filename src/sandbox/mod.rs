use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::engine::compiler::CompiledCommand;
use crate::offload::{BlockingPool, OffloadError};
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub scratch_dir: PathBuf,
    pub search_path: String,
    pub locale: String,
}

impl SandboxConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.engine_timeout(),
            scratch_dir: settings.temp_dir.clone(),
            search_path: settings.engine_search_path.clone(),
            locale: String::from("C"),
        }
    }

    /// The complete environment the child sees.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let scratch = self.scratch_dir.to_string_lossy().to_string();
        vec![
            ("PATH", self.search_path.clone()),
            ("HOME", scratch.clone()),
            ("TMPDIR", scratch.clone()),
            ("MAGICK_TEMPORARY_PATH", scratch),
            ("LC_ALL", self.locale.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Command timed out after {secs} seconds")]
    TimedOut { secs: u64 },
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("failed waiting for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("child output pipe was not captured")]
    MissingPipe,
    #[error(transparent)]
    Offload(#[from] OffloadError),
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, command: &CompiledCommand) -> Result<ExecutionResult, SandboxError>;
}

pub type SharedCommandRunner = Arc<dyn CommandRunner>;

/// Runs compiled engine commands as isolated children: no shell, cleared
/// environment, own process group, scratch working directory and a hard
/// deadline.
#[derive(Debug, Clone)]
pub struct ExecutionSandbox {
    config: SandboxConfig,
    pool: BlockingPool,
}

impl ExecutionSandbox {
    pub fn new(config: SandboxConfig, pool: BlockingPool) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Supervision runs in its own task gated by the pool, so a caller that
    /// stops waiting does not take the child down with it.
    pub async fn execute(&self, command: &CompiledCommand) -> Result<ExecutionResult, SandboxError> {
        let handle = self
            .pool
            .spawn(run_isolated(self.config.clone(), command.clone()));
        match handle.await {
            Ok(outcome) => outcome?,
            Err(join_error) => Err(SandboxError::Offload(OffloadError::Join {
                label: "sandbox.execute",
                message: join_error.to_string(),
            })),
        }
    }
}

#[async_trait]
impl CommandRunner for ExecutionSandbox {
    async fn run(&self, command: &CompiledCommand) -> Result<ExecutionResult, SandboxError> {
        self.execute(command).await
    }
}

async fn run_isolated(
    config: SandboxConfig,
    command: CompiledCommand,
) -> Result<ExecutionResult, SandboxError> {
    tokio::fs::create_dir_all(config.scratch_dir.as_path())
        .await
        .map_err(SandboxError::Scratch)?;

    let mut cmd = Command::new(command.program.as_str());
    cmd.args(command.args.iter())
        .env_clear()
        .envs(config.child_env())
        .current_dir(config.scratch_dir.as_path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let started = Instant::now();
    debug!(command = %command.display(), "spawning engine command");
    let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let mut stdout = child.stdout.take().ok_or(SandboxError::MissingPipe)?;
    let mut stderr = child.stderr.take().ok_or(SandboxError::MissingPipe)?;
    let stdout_task = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = stdout.read_to_end(&mut out).await;
        out
    });
    let stderr_task = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = stderr.read_to_end(&mut out).await;
        out
    });

    let status = match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(status) => status.map_err(SandboxError::Wait)?,
        Err(_) => {
            #[cfg(unix)]
            kill_process_group(&child);
            let _ = child.kill().await;
            stdout_task.abort();
            stderr_task.abort();
            warn!(
                program = %command.program,
                timeout_secs = config.timeout.as_secs(),
                "engine command timed out and was killed"
            );
            return Err(SandboxError::TimedOut {
                secs: config.timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let result = ExecutionResult {
        success: status.success(),
        exit_code: status.code(),
        stdout: String::from_utf8_lossy(stdout.as_slice()).to_string(),
        stderr: String::from_utf8_lossy(stderr.as_slice()).to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    if !result.success {
        warn!(
            program = %command.program,
            exit_code = ?result.exit_code,
            stderr = %excerpt(result.stderr.as_str(), 200),
            "engine command failed"
        );
    }
    Ok(result)
}

/// The child leads its own group, so this also reaches helpers the engine
/// started (ghostscript and friends).
#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) {
    let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg takes plain integers; the group was created by
    // `process_group(0)` at spawn and its leader has not been reaped yet.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

/// Returns at most `limit` characters of `text`.
pub fn excerpt(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sandbox(timeout: Duration) -> ExecutionSandbox {
        let scratch = std::env::temp_dir().join(format!("imagemill_sandbox_{}", uuid::Uuid::new_v4()));
        ExecutionSandbox::new(
            SandboxConfig {
                timeout,
                scratch_dir: scratch,
                search_path: String::from("/usr/local/bin:/usr/bin:/bin"),
                locale: String::from("C"),
            },
            BlockingPool::new(4),
        )
    }

    fn sh(script: &str) -> CompiledCommand {
        CompiledCommand {
            program: String::from("sh"),
            args: vec![String::from("-c"), script.to_string()],
        }
    }

    #[tokio::test]
    async fn child_sees_only_the_minimal_environment() {
        let sandbox = sandbox(Duration::from_secs(10));
        let result = sandbox
            .execute(&sh("env | sort; pwd"))
            .await
            .expect("sh should run");
        assert!(result.success);
        let scratch = sandbox.config().scratch_dir.to_string_lossy().to_string();
        assert!(result.stdout.contains("LC_ALL=C"));
        assert!(result.stdout.contains(format!("MAGICK_TEMPORARY_PATH={scratch}").as_str()));
        assert!(result.stdout.contains(format!("TMPDIR={scratch}").as_str()));
        assert!(!result.stdout.contains("CARGO"));
        assert!(result.stdout.lines().any(|line| line == scratch));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let result = sandbox(Duration::from_secs(10))
            .execute(&sh("echo broken >&2; exit 3"))
            .await
            .expect("sh should run");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "broken");
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let started = Instant::now();
        let err = sandbox(Duration::from_millis(200))
            .execute(&CompiledCommand {
                program: String::from("sleep"),
                args: vec![String::from("5")],
            })
            .await
            .expect_err("sleep should time out");
        assert!(matches!(err, SandboxError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    fn process_is_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state == "Z" || state == "X"),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn deadline_kills_helpers_in_the_process_group() {
        let sandbox = sandbox(Duration::from_millis(500));
        let err = sandbox
            .execute(&sh("sleep 30 & echo $! > helper.pid; wait"))
            .await
            .expect_err("sh should time out");
        assert!(matches!(err, SandboxError::TimedOut { .. }));

        let pid_file = sandbox.config().scratch_dir.join("helper.pid");
        let pid = std::fs::read_to_string(pid_file).expect("helper pid written");
        let pid = pid.trim().to_string();
        let mut gone = false;
        for _ in 0..40 {
            if process_is_gone(pid.as_str()) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "helper {pid} outlived the timed-out engine command");
    }

    #[tokio::test]
    async fn arguments_are_never_shell_interpreted() {
        let result = sandbox(Duration::from_secs(10))
            .execute(&CompiledCommand {
                program: String::from("echo"),
                args: vec![String::from("$(whoami); echo injected")],
            })
            .await
            .expect("echo should run");
        assert_eq!(result.stdout.trim(), "$(whoami); echo injected");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = sandbox(Duration::from_secs(1))
            .execute(&CompiledCommand {
                program: String::from("imagemill-no-such-binary"),
                args: Vec::new(),
            })
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[test]
    fn excerpt_counts_characters() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("ab", 10), "ab");
    }
}
