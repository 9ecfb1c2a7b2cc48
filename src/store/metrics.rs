//! 执行指标：每次沙箱执行后记录一条（成功与否、耗时、错误摘要、迭代次数）
//!
//! 记录是 fire-and-forget 的：`spawn_record` 在后台任务里写入，失败只打 warn，不影响运行。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::store::{truncate_chars, DbPool, StoreError};

/// 一次执行的指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub thread_id: String,
    pub task: String,
    pub success: bool,
    pub duration_ms: f64,
    pub error_type: String,
    pub error_message: String,
    pub iteration_count: u32,
}

/// 成功率统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRate {
    pub total: u64,
    pub successes: u64,
    /// 百分比，0–100
    pub rate: f64,
    pub avg_duration_ms: f64,
    pub avg_iterations: f64,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metrics: ExecutionMetrics) -> Result<(), StoreError>;
}

/// 后台写入指标，调用方不等待结果
pub fn spawn_record(
    sink: Arc<dyn MetricsSink>,
    metrics: ExecutionMetrics,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.record(metrics).await {
            tracing::warn!(error = %e, "failed to record execution metrics");
        }
    })
}

/// 写入 agent_metrics 表
#[derive(Debug, Clone)]
pub struct SqliteMetrics {
    pool: DbPool,
}

impl SqliteMetrics {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// 最近 `limit` 次执行的成功率
    pub async fn recovery_rate(&self, limit: usize) -> Result<RecoveryRate, StoreError> {
        self.pool
            .with_conn(move |conn| {
                let (total, successes, avg_duration_ms, avg_iterations) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(success), 0),
                            COALESCE(AVG(duration_ms), 0), COALESCE(AVG(iteration_count), 0)
                     FROM (SELECT success, duration_ms, iteration_count FROM agent_metrics
                           ORDER BY created_at DESC, id DESC LIMIT ?1)",
                    params![limit as i64],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, i64>(1)?,
                            r.get::<_, f64>(2)?,
                            r.get::<_, f64>(3)?,
                        ))
                    },
                )?;
                let rate = if total > 0 {
                    successes as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                Ok(RecoveryRate {
                    total: total as u64,
                    successes: successes as u64,
                    rate,
                    avg_duration_ms,
                    avg_iterations,
                })
            })
            .await
    }
}

#[async_trait]
impl MetricsSink for SqliteMetrics {
    async fn record(&self, m: ExecutionMetrics) -> Result<(), StoreError> {
        let task = truncate_chars(&m.task, 500);
        let error_message = truncate_chars(&m.error_message, 1000);
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO agent_metrics
                     (thread_id, task, success, duration_ms, error_type, error_message, iteration_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        m.thread_id,
                        task,
                        m.success,
                        m.duration_ms,
                        m.error_type,
                        error_message,
                        m.iteration_count,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

/// 丢弃所有指标
#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

#[async_trait]
impl MetricsSink for NoopMetrics {
    async fn record(&self, _: ExecutionMetrics) -> Result<(), StoreError> {
        Ok(())
    }
}
