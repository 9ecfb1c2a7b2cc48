//! Tinker - 自主任务求解智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 引擎级错误
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Scripted）与嵌入
//! - **memory**: 对话消息
//! - **reasoning**: 决策、代码生成、失败分析、综合、反思
//! - **sandbox**: Docker 沙箱执行与产物回收
//! - **store**: SQLite 连接池、检查点、知识库、执行指标
//! - **tools**: 受信工具与分发器
//! - **workflow**: 状态机引擎

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod reasoning;
pub mod sandbox;
pub mod store;
pub mod tools;
pub mod workflow;

pub use workflow::{EngineBuilder, RunOutcome, RunRequest, WorkflowEngine};
