//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TINKER__*` 覆盖（双下划线表示嵌套，如 `TINKER__SANDBOX__IMAGE=python:3.12-slim`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub sandbox: SandboxSection,
    pub store: StoreSection,
    pub workflow: WorkflowSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具读写文件、执行命令的根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: Some("tinker".to_string()),
            workspace_root: None,
        }
    }
}

/// [llm] 段：模型与端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 向量检索使用的嵌入模型
    pub embedding_model: String,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// [tools] 段：命令超时、SQL 结果截断
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// run_command 超时（秒）
    pub command_timeout_secs: u64,
    /// sql_db 输出的最大字符数
    pub sql_max_chars: usize,
    /// list_files 默认递归深度
    pub list_max_depth: usize,
    /// 文件工具只允许访问工作区内的路径
    pub confine_to_workspace: bool,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            sql_max_chars: 5000,
            list_max_depth: 2,
            confine_to_workspace: true,
        }
    }
}

/// [sandbox] 段：镜像、资源上限、预装包、产物目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub image: String,
    /// docker --memory 取值
    pub memory: String,
    /// docker --cpus 取值（0.5 即 50% 单核）
    pub cpus: f64,
    pub workdir: String,
    /// 容器启动后预装的 pip 包
    pub bootstrap_packages: Vec<String>,
    /// 产物落盘目录（按运行 id 分子目录）
    pub artifact_dir: PathBuf,
    /// docker 可执行文件名或路径
    pub docker_bin: String,
    /// 使用 host 网络（pip install 需要出网）
    pub host_network: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            memory: "512m".to_string(),
            cpus: 0.5,
            workdir: "/app".to_string(),
            bootstrap_packages: vec!["mpmath".to_string()],
            artifact_dir: PathBuf::from("sandbox_artifacts"),
            docker_bin: "docker".to_string(),
            host_network: true,
        }
    }
}

/// [store] 段：数据库文件与连接池大小
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub database_path: PathBuf,
    pub pool_size: usize,
    /// 无嵌入 API Key 时是否仍启用知识库（否则退化为 Noop）
    pub knowledge_enabled: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/tinker.db"),
            pool_size: 8,
            knowledge_enabled: true,
        }
    }
}

/// [workflow] 段：迭代与工具调用上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// generate_code → execute → reflect 循环上限
    pub max_iterations: u32,
    /// 单轮内受信工具调用上限
    pub max_tool_calls: u32,
    /// think 阶段带入的历史消息条数
    pub history_window: usize,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_tool_calls: 3,
            history_window: 10,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TINKER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TINKER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TINKER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_sandbox_limits() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sandbox.memory, "512m");
        assert!((cfg.sandbox.cpus - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.sandbox.workdir, "/app");
        assert_eq!(cfg.workflow.max_iterations, 3);
        assert_eq!(cfg.workflow.max_tool_calls, 3);
        assert_eq!(cfg.tools.command_timeout_secs, 30);
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[sandbox]\nimage = \"python:3.11\"\n\n[workflow]\nmax_iterations = 5\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.sandbox.image, "python:3.11");
        assert_eq!(cfg.workflow.max_iterations, 5);
        // 未出现的键保持默认
        assert_eq!(cfg.workflow.max_tool_calls, 3);
        assert_eq!(cfg.sandbox.memory, "512m");
    }
}
