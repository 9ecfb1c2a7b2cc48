//! 引擎级错误类型
//!
//! 协作者输出解析失败、工具失败、沙箱失败、外部存储不可用都不会走到这里：
//! 前三者分别降级为默认值、`ERROR:` 文本与日志条目，存储失败记录 warn 后跳过。
//! 只有引擎自身的意外故障才构造 AgentError，并使本次运行以失败结束。

use thiserror::Error;

use crate::sandbox::SandboxError;
use crate::store::StoreError;

/// 工作流运行过程中的致命错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("No checkpoint found for thread {0}")]
    NoCheckpoint(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Node {node} failed: {detail}")]
    NodeFailed { node: String, detail: String },
}

impl AgentError {
    pub fn node_failed(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NodeFailed {
            node: node.into(),
            detail: detail.into(),
        }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}
