//! Docker 沙箱：部署文件、顺序执行命令、回收产物
//!
//! 单次 `run` 从不返回错误：所有失败都落在日志里（`LogKind::Error`），容器在任何路径下都会被删除。

pub mod archive;
pub mod filter;
pub mod log;
pub mod runtime;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;

pub use archive::{build_archive, extract_archive};
pub use filter::{filter_apt_noise, filter_commands, is_install_noise, CommandPlan};
pub use log::{LogCallback, LogEntry, LogKind, ERROR_MARKERS};
pub use runtime::{ContainerGuard, ContainerRuntime, ContainerSpec, DockerCli, ExecOutput};

use log::Transcript;

/// 执行器写入的归档名，回收产物时跳过
const ARCHIVE_NAME: &str = "archive.tar";

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("{0}")]
    Spawn(String),

    #[error("docker {step} failed: {detail}")]
    Docker { step: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution cancelled")]
    Cancelled,
}

/// 一次沙箱执行的结果
#[derive(Debug, Clone, Default)]
pub struct SandboxRun {
    pub logs: Vec<LogEntry>,
    /// 产物文件名 → 宿主机路径
    pub artifacts: BTreeMap<String, PathBuf>,
}

pub struct Sandbox {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxSection,
}

impl Sandbox {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxSection) -> Self {
        Self { runtime, config }
    }

    /// 使用本机 docker 命令行
    pub fn docker(config: SandboxSection) -> Self {
        let cli = DockerCli::new(config.docker_bin.clone());
        Self::new(Arc::new(cli), config)
    }

    pub fn config(&self) -> &SandboxSection {
        &self.config
    }

    /// 在新容器里部署 files 并按序执行 commands
    ///
    /// 单条命令失败不会中止后续命令。`on_log` 在每条日志产生时立即调用。
    pub async fn run(
        &self,
        files: &BTreeMap<String, String>,
        commands: &[String],
        on_log: Option<&LogCallback>,
    ) -> SandboxRun {
        self.run_until(files, commands, on_log, &CancellationToken::new())
            .await
    }

    /// 同 [`Sandbox::run`]，`cancel` 触发时放弃正在执行的命令并删除容器
    pub async fn run_until(
        &self,
        files: &BTreeMap<String, String>,
        commands: &[String],
        on_log: Option<&LogCallback>,
        cancel: &CancellationToken,
    ) -> SandboxRun {
        let mut t = Transcript::new(on_log);
        let mut artifacts = BTreeMap::new();

        t.push(
            LogKind::System,
            format!("Initializing sandbox ({})...", self.config.image),
        );
        if let Err(e) = self.runtime.ensure_image(&self.config.image).await {
            t.push(LogKind::Error, format!("Sandbox error: {e}"));
            return SandboxRun {
                logs: t.into_entries(),
                artifacts,
            };
        }

        let plan = filter_commands(commands);
        for cmd in &plan.skipped {
            t.push(LogKind::System, format!("Skipped (pre-installed): {cmd}"));
        }
        for name in files.keys() {
            t.push(LogKind::File, format!("Created: {name}"));
        }

        let archive = match build_archive(files) {
            Ok(a) => a,
            Err(e) => {
                t.push(LogKind::Error, format!("Sandbox error: {e}"));
                return SandboxRun {
                    logs: t.into_entries(),
                    artifacts,
                };
            }
        };

        t.push(LogKind::System, "Starting container...");
        let spec = ContainerSpec::from_config(&self.config);
        let id = match self.runtime.start(&spec).await {
            Ok(id) => id,
            Err(e) => {
                t.push(LogKind::Error, format!("Sandbox error: {e}"));
                return SandboxRun {
                    logs: t.into_entries(),
                    artifacts,
                };
            }
        };
        tracing::debug!(container = %id, "sandbox container started");
        let guard = ContainerGuard::new(Arc::clone(&self.runtime), id);

        let driven = tokio::select! {
            r = self.drive(&guard, files, archive, &plan.run, &mut t, &mut artifacts) => r,
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        };
        if let Err(e) = driven {
            t.push(LogKind::Error, format!("Sandbox error: {e}"));
        }

        t.push(LogKind::System, "Cleaning up...");
        if let Err(e) = guard.release().await {
            tracing::warn!(error = %e, "failed to remove sandbox container");
        }

        SandboxRun {
            logs: t.into_entries(),
            artifacts,
        }
    }

    async fn drive(
        &self,
        guard: &ContainerGuard,
        files: &BTreeMap<String, String>,
        archive: Vec<u8>,
        commands: &[String],
        t: &mut Transcript<'_>,
        artifacts: &mut BTreeMap<String, PathBuf>,
    ) -> Result<(), SandboxError> {
        let id = guard.id();
        let workdir = self.config.workdir.as_str();

        self.runtime.put_archive(id, workdir, archive).await?;
        t.push(
            LogKind::System,
            format!("Deployed {} files to {}", files.len(), workdir),
        );

        if !self.config.bootstrap_packages.is_empty() {
            let bootstrap = format!(
                "pip install {} --break-system-packages -q 2>/dev/null",
                self.config.bootstrap_packages.join(" ")
            );
            match self.runtime.exec(id, workdir, &bootstrap).await {
                Ok(out) if out.exit_code != 0 => {
                    tracing::debug!(exit_code = out.exit_code, "bootstrap install failed")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "bootstrap install skipped"),
            }
        }

        for cmd in commands {
            t.push(LogKind::Command, format!("$ {cmd}"));
            let out = self.runtime.exec(id, workdir, cmd).await?;
            let noisy = cmd.to_lowercase().contains("apt");
            push_stream(t, LogKind::Stdout, &out.stdout, noisy);
            push_stream(t, LogKind::Stderr, &out.stderr, noisy);
            if out.exit_code != 0 {
                t.push(LogKind::Error, format!("Exit code {}", out.exit_code));
            } else {
                t.push(LogKind::Success, "OK");
            }
        }

        t.push(LogKind::System, "Checking for artifacts...");
        let listing = self
            .runtime
            .exec(id, workdir, "find . -maxdepth 1 -not -type d")
            .await?;
        if listing.exit_code != 0 {
            return Ok(());
        }

        let dest = self
            .config
            .artifact_dir
            .join(uuid::Uuid::new_v4().to_string());
        let listing = String::from_utf8_lossy(&listing.stdout).into_owned();
        for line in listing.lines() {
            let line = line.trim();
            let name = line.strip_prefix("./").unwrap_or(line);
            if name.is_empty() || name == ARCHIVE_NAME || files.contains_key(name) {
                continue;
            }
            t.push(LogKind::System, format!("Retrieving artifact: {name}"));
            let path = format!("{}/{}", workdir.trim_end_matches('/'), name);
            let fetched = match self.runtime.get_archive(id, &path).await {
                Ok(bytes) => extract_archive(&bytes, &dest).map_err(SandboxError::from),
                Err(e) => Err(e),
            };
            match fetched {
                Ok(()) => {
                    artifacts.insert(name.to_string(), dest.join(name));
                }
                Err(e) => t.push(LogKind::Error, format!("Failed to retrieve {name}: {e}")),
            }
        }
        Ok(())
    }
}

fn push_stream(t: &mut Transcript<'_>, kind: LogKind, bytes: &[u8], noisy: bool) {
    if bytes.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(bytes).into_owned();
    let text = if noisy {
        filter_apt_noise(&text)
    } else if text.trim().is_empty() {
        None
    } else {
        Some(text)
    };
    if let Some(text) = text {
        t.push(kind, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 按命令返回预设输出，并记录调用
    #[derive(Default)]
    struct FakeRuntime {
        replies: Vec<(&'static str, ExecOutput)>,
        artifact: Option<(&'static str, &'static str)>,
        fail_start: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        fn log(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: vec![],
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
            self.log(format!("image {image}"));
            Ok(())
        }
        async fn start(&self, _spec: &ContainerSpec) -> Result<String, SandboxError> {
            if self.fail_start {
                return Err(SandboxError::Docker {
                    step: "run".into(),
                    detail: "daemon unavailable".into(),
                });
            }
            self.log("start".into());
            Ok("c1".into())
        }
        async fn put_archive(&self, id: &str, dest: &str, _: Vec<u8>) -> Result<(), SandboxError> {
            self.log(format!("put {id}:{dest}"));
            Ok(())
        }
        async fn exec(&self, _id: &str, _w: &str, command: &str) -> Result<ExecOutput, SandboxError> {
            self.log(format!("exec {command}"));
            if command.starts_with("find ") {
                let listing = match self.artifact {
                    Some((name, _)) => format!("./main.py\n./archive.tar\n./{name}\n"),
                    None => "./main.py\n".to_string(),
                };
                return Ok(ok(&listing));
            }
            Ok(self
                .replies
                .iter()
                .find(|(c, _)| *c == command)
                .map(|(_, o)| o.clone())
                .unwrap_or_default())
        }
        async fn get_archive(&self, _id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
            let (name, content) = self.artifact.ok_or_else(|| SandboxError::Spawn("none".into()))?;
            assert!(path.ends_with(name));
            let files = BTreeMap::from([(name.to_string(), content.to_string())]);
            Ok(build_archive(&files)?)
        }
        async fn remove(&self, id: &str) -> Result<(), SandboxError> {
            self.log(format!("rm {id}"));
            Ok(())
        }
    }

    fn sandbox(fake: Arc<FakeRuntime>, artifact_dir: PathBuf) -> Sandbox {
        let mut cfg = SandboxSection::default();
        cfg.artifact_dir = artifact_dir;
        Sandbox::new(fake, cfg)
    }

    fn main_py() -> BTreeMap<String, String> {
        BTreeMap::from([("main.py".to_string(), "print(1+1)".to_string())])
    }

    #[tokio::test]
    async fn test_runs_commands_and_cleans_up() {
        let fake = Arc::new(FakeRuntime {
            replies: vec![("python main.py", ok("2\n"))],
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let run = sb.run(&main_py(), &["python main.py".to_string()], None).await;
        let kinds: Vec<LogKind> = run.logs.iter().map(|l| l.kind).collect();
        assert!(kinds.contains(&LogKind::Stdout));
        assert!(!run.logs.iter().any(|l| l.indicates_failure()));
        assert_eq!(run.logs.last().unwrap().content, "Cleaning up...");
        assert!(run.logs.iter().any(|l| l.content == "Deployed 1 files to /app"));

        let calls = fake.calls();
        assert!(calls.iter().any(|c| c.contains("pip install mpmath --break-system-packages -q")));
        assert_eq!(calls.last().unwrap(), "rm c1");
    }

    #[tokio::test]
    async fn test_failing_command_does_not_stop_the_rest() {
        let fake = Arc::new(FakeRuntime {
            replies: vec![(
                "python bad.py",
                ExecOutput {
                    exit_code: 1,
                    stdout: vec![],
                    stderr: b"NameError: name 'x' is not defined".to_vec(),
                },
            )],
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let cmds = vec!["python bad.py".to_string(), "echo done".to_string()];
        let run = sb.run(&main_py(), &cmds, None).await;
        assert!(run.logs.iter().any(|l| l.kind == LogKind::Error && l.content == "Exit code 1"));
        assert!(run.logs.iter().any(|l| l.content == "$ echo done"));
    }

    #[tokio::test]
    async fn test_skipped_commands_are_logged() {
        let fake = Arc::new(FakeRuntime::default());
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let cmds = vec!["apt-get update".to_string(), "pip install numpy".to_string()];
        let run = sb.run(&main_py(), &cmds, None).await;
        assert!(run
            .logs
            .iter()
            .any(|l| l.content == "Skipped (pre-installed): apt-get update"));
        assert!(fake
            .calls()
            .contains(&"exec pip install numpy --break-system-packages".to_string()));
    }

    #[tokio::test]
    async fn test_artifacts_retrieved_and_inputs_skipped() {
        let fake = Arc::new(FakeRuntime {
            artifact: Some(("out.csv", "a,b\n1,2\n")),
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let run = sb.run(&main_py(), &["python main.py".to_string()], None).await;
        assert_eq!(run.artifacts.len(), 1);
        let path = &run.artifacts["out.csv"];
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a,b\n1,2\n");
        assert!(!run.logs.iter().any(|l| l.content.contains("Retrieving artifact: main.py")));
    }

    /// exec 永不返回，模拟死循环的生成代码
    struct HangingRuntime {
        inner: FakeRuntime,
    }

    #[async_trait]
    impl ContainerRuntime for HangingRuntime {
        async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
            self.inner.ensure_image(image).await
        }
        async fn start(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
            self.inner.start(spec).await
        }
        async fn put_archive(&self, id: &str, dest: &str, a: Vec<u8>) -> Result<(), SandboxError> {
            self.inner.put_archive(id, dest, a).await
        }
        async fn exec(&self, id: &str, w: &str, command: &str) -> Result<ExecOutput, SandboxError> {
            if command.starts_with("python") {
                self.inner.log(format!("exec {command}"));
                std::future::pending::<()>().await;
            }
            self.inner.exec(id, w, command).await
        }
        async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
            self.inner.get_archive(id, path).await
        }
        async fn remove(&self, id: &str) -> Result<(), SandboxError> {
            self.inner.remove(id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_abandons_hung_command_and_removes_container() {
        let fake = Arc::new(HangingRuntime {
            inner: FakeRuntime::default(),
        });
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = SandboxSection::default();
        cfg.artifact_dir = dir.path().to_path_buf();
        let sb = Sandbox::new(fake.clone(), cfg);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let run = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            sb.run_until(&main_py(), &["python loop.py".to_string()], None, &cancel),
        )
        .await
        .unwrap();

        assert!(run
            .logs
            .iter()
            .any(|l| l.kind == LogKind::Error && l.content == "Sandbox error: execution cancelled"));
        let calls = fake.inner.calls();
        assert!(calls.contains(&"exec python loop.py".to_string()));
        assert_eq!(calls.last().unwrap(), "rm c1");
    }

    #[tokio::test]
    async fn test_start_failure_is_logged_not_raised() {
        let fake = Arc::new(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let run = sb.run(&main_py(), &["python main.py".to_string()], None).await;
        let last = run.logs.last().unwrap();
        assert_eq!(last.kind, LogKind::Error);
        assert!(last.content.starts_with("Sandbox error: docker run failed"));
    }

    #[tokio::test]
    async fn test_live_callback_sees_every_entry() {
        let fake = Arc::new(FakeRuntime::default());
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox(Arc::clone(&fake), dir.path().to_path_buf());

        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let cb = move |_: &LogEntry| *counter.lock().unwrap() += 1;
        let run = sb.run(&main_py(), &["ls".to_string()], Some(&cb)).await;
        assert_eq!(*seen.lock().unwrap(), run.logs.len());
    }
}
