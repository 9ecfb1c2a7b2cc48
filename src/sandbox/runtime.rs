//! 容器运行时抽象与 docker CLI 实现
//!
//! `ContainerRuntime` 只暴露沙箱需要的几个动作；测试里用假的实现替换。

use std::process::{Output, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::SandboxSection;
use crate::sandbox::SandboxError;

/// 启动一个常驻容器所需的参数
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub workdir: String,
    pub memory: String,
    pub cpus: f64,
    pub host_network: bool,
    pub env: Vec<(String, String)>,
}

impl ContainerSpec {
    pub fn from_config(cfg: &SandboxSection) -> Self {
        Self {
            image: cfg.image.clone(),
            workdir: cfg.workdir.clone(),
            memory: cfg.memory.clone(),
            cpus: cfg.cpus,
            host_network: cfg.host_network,
            env: vec![
                ("DEBIAN_FRONTEND".into(), "noninteractive".into()),
                ("TZ".into(), "UTC".into()),
                ("PYTHONDONTWRITEBYTECODE".into(), "1".into()),
            ],
        }
    }
}

/// 容器内一条命令的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// 本地没有镜像时拉取
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// 启动常驻容器，返回容器 id
    async fn start(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    /// 把 tar 包解到容器内 dest 目录
    async fn put_archive(&self, id: &str, dest: &str, archive: Vec<u8>)
        -> Result<(), SandboxError>;

    /// `sh -c` 执行；非零退出码不算错误
    async fn exec(&self, id: &str, workdir: &str, command: &str)
        -> Result<ExecOutput, SandboxError>;

    /// 取出容器内路径，返回 tar 字节
    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError>;

    /// 强制删除容器
    async fn remove(&self, id: &str) -> Result<(), SandboxError>;
}

/// 通过 docker 命令行驱动容器
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn output(&self, args: &[&str]) -> Result<Output, SandboxError> {
        Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Spawn(format!("failed to exec {}: {}", self.bin, e)))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<Output, SandboxError> {
        let out = self.output(args).await?;
        check(args, out)
    }
}

fn check(args: &[&str], out: Output) -> Result<Output, SandboxError> {
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(SandboxError::Docker {
        step: args.first().copied().unwrap_or_default().to_string(),
        detail,
    })
}

pub(crate) fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "-w".into(),
        spec.workdir.clone(),
        "--memory".into(),
        spec.memory.clone(),
        "--cpus".into(),
        spec.cpus.to_string(),
    ];
    if spec.host_network {
        args.push("--network".into());
        args.push("host".into());
    }
    for (k, v) in &spec.env {
        args.push("-e".into());
        args.push(format!("{k}={v}"));
    }
    args.push(spec.image.clone());
    args.extend(["tail".into(), "-f".into(), "/dev/null".into()]);
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.output(&["image", "inspect", image]).await?.status.success() {
            return Ok(());
        }
        tracing::info!(image, "pulling sandbox image");
        self.run_checked(&["pull", image]).await.map(|_| ())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let args = run_args(spec);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run_checked(&refs).await?;
        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if id.is_empty() {
            return Err(SandboxError::Docker {
                step: "run".into(),
                detail: "no container id returned".into(),
            });
        }
        Ok(id)
    }

    async fn put_archive(
        &self,
        id: &str,
        dest: &str,
        archive: Vec<u8>,
    ) -> Result<(), SandboxError> {
        let target = format!("{id}:{dest}");
        let args = ["cp", "-", target.as_str()];
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(format!("failed to exec {}: {}", self.bin, e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&archive).await?;
            stdin.shutdown().await?;
        }
        let out = child.wait_with_output().await?;
        check(&args, out).map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        workdir: &str,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        let out = self
            .output(&["exec", "-w", workdir, id, "sh", "-c", command])
            .await?;
        Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        let source = format!("{id}:{path}");
        let out = self.run_checked(&["cp", source.as_str(), "-"]).await?;
        Ok(out.stdout)
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.run_checked(&["rm", "-f", id]).await.map(|_| ())
    }
}

/// 持有容器，离开作用域时保证删除
///
/// 正常路径调用 [`ContainerGuard::release`]；提前返回或 panic 时由 Drop 在后台删除。
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub async fn release(mut self) -> Result<(), SandboxError> {
        match self.id.take() {
            Some(id) => self.runtime.remove(&id).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = Arc::clone(&self.runtime);
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        tracing::warn!(container = %id, error = %e, "container cleanup failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(container = %id, "no runtime to remove container, it may be leaked");
            }
        }
    }
}
