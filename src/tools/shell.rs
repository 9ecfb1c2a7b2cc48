//! run_command：在宿主上执行 shell 命令
//!
//! 通过 sh -c 执行，带超时；超时后子进程随 future 一起被 kill。

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;

/// Shell 执行器：固定超时，默认工作目录为工作区根
#[derive(Debug, Clone)]
pub struct ShellRunner {
    default_cwd: PathBuf,
    timeout_secs: u64,
}

impl ShellRunner {
    pub fn new(default_cwd: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            default_cwd: default_cwd.into(),
            timeout_secs,
        }
    }

    /// 返回 `Exit Code: N\nSTDOUT:\n...`，有 stderr 时追加 `STDERR:` 段；非零退出码不算失败
    pub async fn run(&self, command: &str, cwd: Option<PathBuf>) -> Result<String, String> {
        let command = command.trim();
        if command.is_empty() {
            return Err("Empty command".to_string());
        }
        let cwd = cwd.unwrap_or_else(|| self.default_cwd.clone());
        tracing::info!(command = %command, cwd = %cwd.display(), "run_command");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]).current_dir(&cwd).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
            .map_err(|e| format!("Error running command: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);
        let mut out = format!("Exit Code: {}\nSTDOUT:\n{}\n", code, stdout);
        if !stderr.is_empty() {
            out.push_str(&format!("STDERR:\n{}\n", stderr));
        }
        Ok(out)
    }
}
