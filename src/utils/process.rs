use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{BackupError, Result};

const STDERR_TAIL_BYTES: usize = 2_000;
const MASK: &str = "****";

enum StdoutTarget {
    Null,
    File { path: PathBuf, append: bool },
    Capture,
}

/// Resolves client tools either on `PATH` or inside a fixed directory.
#[derive(Debug, Clone, Default)]
pub struct ToolLocator {
    dir: Option<PathBuf>,
}

impl ToolLocator {
    pub fn from_path() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    pub fn command(&self, tool: &str, timeout: Duration) -> Result<ToolCommand> {
        match &self.dir {
            Some(dir) => Ok(ToolCommand::new(tool, dir.join(tool), timeout)),
            None => ToolCommand::locate(tool, timeout),
        }
    }
}

/// Result of a tool run that exited with status zero.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr_tail: String,
}

/// One invocation of an external client tool. Arguments are passed as a discrete
/// list; credentials travel in environment variables.
pub struct ToolCommand {
    tool: String,
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    stdin: Option<PathBuf>,
    stdout: StdoutTarget,
    timeout: Duration,
}

impl ToolCommand {
    /// Resolves `tool` on `PATH`.
    pub fn locate(tool: &str, timeout: Duration) -> Result<Self> {
        let program = super::find_executable(tool)?;
        Ok(Self::new(tool, program, timeout))
    }

    pub fn new(tool: &str, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            tool: tool.to_string(),
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: None,
            stdout: StdoutTarget::Null,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.envs.push((key.to_string(), value.into()));
        self
    }

    pub fn stdin_from(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = StdoutTarget::File {
            path: path.to_path_buf(),
            append: false,
        };
        self
    }

    pub fn append_stdout_to(mut self, path: &Path) -> Self {
        self.stdout = StdoutTarget::File {
            path: path.to_path_buf(),
            append: true,
        };
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.stdout = StdoutTarget::Capture;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// The command line as it may appear in logs.
    pub fn display_masked(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(mask_args(&self.args));
        parts.join(" ")
    }

    /// A configured `tokio` command with environment applied and stdio left to the
    /// caller. Used by long-lived readers that consume stdout incrementally.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }

    /// Runs the tool to completion. A non-zero exit becomes `ToolInvocation` carrying
    /// the exit code and the stderr tail; exceeding the timeout kills the process and
    /// fails with `Timeout`.
    pub async fn run(self) -> Result<ToolOutput> {
        debug!(command = %self.display_masked(), "Running external tool");
        let mut command = self.to_command();
        command.stderr(Stdio::piped());
        match &self.stdin {
            Some(path) => {
                command.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        match &self.stdout {
            StdoutTarget::Null => {
                command.stdout(Stdio::null());
            }
            StdoutTarget::File { path, append } => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(*append)
                    .truncate(!*append)
                    .open(path)?;
                command.stdout(Stdio::from(file));
            }
            StdoutTarget::Capture => {
                command.stdout(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|e| {
            BackupError::tool_failure(&self.tool, None, format!("failed to start: {}", e))
        })?;
        let stderr_task = child.stderr.take().map(|s| drain(s, STDERR_TAIL_BYTES));
        let stdout_task = child.stdout.take().map(|s| drain(s, usize::MAX));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(tool = %self.tool, timeout = ?self.timeout, "Tool timed out, killing it");
                if let Err(e) = child.kill().await {
                    warn!(tool = %self.tool, error = %e, "Failed to kill timed out tool");
                }
                return Err(BackupError::Timeout {
                    operation: self.tool.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stderr_tail = collect(stderr_task).await;
        let stdout = collect(stdout_task).await;
        if !status.success() {
            return Err(BackupError::tool_failure(&self.tool, status.code(), stderr_tail.trim()));
        }
        Ok(ToolOutput { stdout, stderr_tail })
    }
}

/// Reads a pipe to its end on a background task, keeping at most the last `keep` bytes.
fn drain<R>(mut reader: R, keep: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut buffer = [0u8; 8192];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    kept.extend_from_slice(&buffer[..n]);
                    if kept.len() > keep {
                        let excess = kept.len() - keep;
                        kept.drain(..excess);
                    }
                }
            }
        }
        kept
    })
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

/// Replaces credential-shaped arguments: `-pSECRET`, `--password=SECRET` and the
/// password component of connection URLs.
pub fn mask_args(args: &[String]) -> Vec<String> {
    args.iter().map(|arg| mask_arg(arg)).collect()
}

fn mask_arg(arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix("--password=") {
        if !rest.is_empty() {
            return format!("--password={}", MASK);
        }
    }
    if arg.len() > 2 && arg.starts_with("-p") && !arg.starts_with("--") {
        return format!("-p{}", MASK);
    }
    if arg.contains("://") {
        if let Ok(mut url) = Url::parse(arg) {
            if url.password().is_some() && url.set_password(Some(MASK)).is_ok() {
                return url.to_string();
            }
        }
    }
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_args() {
        let args: Vec<String> = [
            "-uroot",
            "-psecret",
            "--password=hunter2",
            "--single-transaction",
            "postgres://admin:pw@db:5432/app",
            "-p",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let masked = mask_args(&args);
        assert_eq!(masked[0], "-uroot");
        assert_eq!(masked[1], "-p****");
        assert_eq!(masked[2], "--password=****");
        assert_eq!(masked[3], "--single-transaction");
        assert_eq!(masked[4], "postgres://admin:****@db:5432/app");
        assert_eq!(masked[5], "-p");
        assert!(!masked.join(" ").contains("secret"));
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_stdout_to_file_and_env() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "dump", "echo \"pw=$MYSQL_PWD arg=$1\"");
            let out = dir.path().join("out.sql");
            ToolCommand::new("dump", program, Duration::from_secs(5))
                .arg("first")
                .env("MYSQL_PWD", "s3cret")
                .stdout_to(&out)
                .run()
                .await
                .unwrap();
            assert_eq!(std::fs::read_to_string(&out).unwrap(), "pw=s3cret arg=first\n");
        }

        #[tokio::test]
        async fn test_append_keeps_existing_content() {
            let dir = tempfile::tempdir().unwrap();
            script(&dir, "binlog", "echo body");
            let out = dir.path().join("out.sql");
            std::fs::write(&out, "-- header\n").unwrap();
            ToolLocator::in_dir(dir.path())
                .command("binlog", Duration::from_secs(5))
                .unwrap()
                .append_stdout_to(&out)
                .run()
                .await
                .unwrap();
            assert_eq!(std::fs::read_to_string(&out).unwrap(), "-- header\nbody\n");
        }

        #[tokio::test]
        async fn test_non_zero_exit_reports_code_and_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "dump", "echo 'Access denied' >&2; exit 2");
            let err = ToolCommand::new("mysqldump", program, Duration::from_secs(5))
                .run()
                .await
                .unwrap_err();
            match err {
                BackupError::ToolInvocation { tool, code, stderr } => {
                    assert_eq!(tool, "mysqldump");
                    assert_eq!(code, Some(2));
                    assert_eq!(stderr, "Access denied");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_timeout_kills_process() {
            let dir = tempfile::tempdir().unwrap();
            let program = script(&dir, "slow", "sleep 30");
            let started = std::time::Instant::now();
            let err = ToolCommand::new("slow", program, Duration::from_millis(200))
                .run()
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::Timeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_stdin_and_capture() {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("in.sql");
            std::fs::write(&input, "SELECT 1;\n").unwrap();
            let program = script(&dir, "client", "cat");
            let output = ToolCommand::new("client", program, Duration::from_secs(5))
                .stdin_from(&input)
                .capture_stdout()
                .run()
                .await
                .unwrap();
            assert_eq!(output.stdout, "SELECT 1;\n");
        }
    }
}
