//! 持久化层：连接池、检查点、知识库（方案 / 事实 / 教训 / 文档）、执行指标
//!
//! 连接池由进程持有并显式注入各组件；所有写入均为追加 / 插入，去重只是插入前的尽力检查。

pub mod checkpoint;
pub mod knowledge;
pub mod metrics;
pub mod pool;

use thiserror::Error;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointStore, CheckpointTuple,
    InMemoryCheckpointStore, PendingWrite, SqliteCheckpointStore,
};
pub use knowledge::{
    chunk_text, format_rag_context, DocumentChunk, KnowledgeStore, LessonRecord, NoopKnowledge,
    SolutionRecord, SqliteKnowledgeStore,
};
pub use metrics::{ExecutionMetrics, MetricsSink, NoopMetrics, RecoveryRate, SqliteMetrics};
pub use pool::DbPool;

/// 持久化错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Pool error: {0}")]
    Pool(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Checkpoint id required for {0}")]
    MissingCheckpointId(&'static str),

    #[error("Blocking task failed: {0}")]
    Join(String),
}

/// 按字符截断（不切断 UTF-8 字符）
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
