//! Case executors: the capability that actually runs one case.

use crate::scheduler::{SchedulerError, SchedulerResult};
use crate::storage::TestCase;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a single case ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed(String),
    Skipped(String),
}

/// Trait for everything that can run a test case.
///
/// `Err` means the case could not be run at all (spawn failure, timeout);
/// the runner records it as a failed case and moves on.
#[async_trait::async_trait]
pub trait CaseExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, case: &TestCase) -> SchedulerResult<CaseOutcome>;
}

/// Always passes after a short delay.
#[derive(Debug, Clone)]
pub struct StubExecutor {
    delay: Duration,
}

impl StubExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for StubExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[async_trait::async_trait]
impl CaseExecutor for StubExecutor {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn execute(&self, case: &TestCase) -> SchedulerResult<CaseOutcome> {
        debug!(case = %case.case_name, "Stub executor run");
        tokio::time::sleep(self.delay).await;
        Ok(CaseOutcome::Passed)
    }
}

/// Runs `<program> <args..> <case file>` and maps the exit code.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
            timeout: Duration::from_secs(600),
            workdir: None,
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }
}

#[async_trait::async_trait]
impl CaseExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, case: &TestCase) -> SchedulerResult<CaseOutcome> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&case.file_name)
            .envs(&self.env)
            .env("CADENCE_CASE_HASH", &case.case_hash)
            .env("CADENCE_CASE_CLASS", &case.class_name)
            .env("CADENCE_CASE_NAME", &case.case_name)
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        debug!(program = %self.program, case = %case.case_name, file = %case.file_name, "Spawning case process");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                SchedulerError::Execution(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| SchedulerError::Execution(format!("failed to run {}: {}", self.program, e)))?;

        if output.status.success() {
            return Ok(CaseOutcome::Passed);
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());

        Ok(CaseOutcome::Failed(format!(
            "exit status {}: {}",
            code,
            combined.trim()
        )))
    }
}

/// Build the executor selected in configuration.
pub fn from_config(cfg: &crate::config::ExecutorConfig) -> Arc<dyn CaseExecutor> {
    match cfg.kind {
        crate::config::ExecutorKind::Stub => {
            Arc::new(StubExecutor::new(Duration::from_millis(cfg.stub_delay_ms)))
        }
        crate::config::ExecutorKind::Process => Arc::new(
            ProcessExecutor::new(cfg.program.clone(), cfg.args.clone())
                .with_env(cfg.env.clone())
                .with_timeout(Duration::from_secs(cfg.timeout_sec))
                .with_workdir(cfg.workdir.clone()),
        ),
    }
}
