//! 检查点存储
//!
//! 每个有状态步骤追加一个不可变检查点（链到父检查点），下一次检查点落盘前的中间写入
//! 以挂起写入（pending writes）记录，崩溃后按序号回放即可还原中断点。
//! 「当前」检查点按创建时间取最新（同一时刻按插入顺序），不依赖 id 字典序。

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{DbPool, StoreError};

/// list 默认条数
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// 定位检查点：线程 + 命名空间 + 可选检查点 id（为空表示最新）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
    #[serde(default)]
    pub checkpoint_ns: String,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

impl CheckpointConfig {
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }
}

/// 状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// 写入时间（RFC 3339，微秒）
    pub ts: String,
    /// 序列化后的运行状态
    pub state: Value,
}

impl Checkpoint {
    pub fn new(state: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ts: now_micros(),
            state,
        }
    }
}

/// 检查点元数据：步数、刚执行的节点、下一节点
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// input（运行开始）/ loop（节点执行后）
    pub source: String,
    pub step: i64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

/// 挂起写入：某个任务在下一个检查点之前提交的一条通道写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: i64,
    pub channel: String,
    pub type_tag: String,
    pub value: Value,
}

/// get_tuple / list 的返回单元
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
    /// 仅 get_tuple 填充；list 返回空
    pub pending_writes: Vec<PendingWrite>,
}

/// 检查点存储：可被多个运行并发访问（按 thread_id 区分行）
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加检查点，父检查点取自 `config.checkpoint_id`；返回指向新检查点的配置
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointConfig, StoreError>;

    /// 针对 `config.checkpoint_id` 追加挂起写入，序号在该检查点内单调递增
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<(), StoreError>;

    /// 指定 id 或最新检查点，连同其挂起写入（按序号）
    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError>;

    /// 新到旧列出线程的检查点；`before` 限定为早于该检查点创建的记录
    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>, StoreError>;
}

fn now_micros() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// JSON 值的类型标签
pub fn type_tag(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn tuple_from_parts(
    config: &CheckpointConfig,
    checkpoint_id: String,
    parent_id: Option<String>,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    pending_writes: Vec<PendingWrite>,
) -> CheckpointTuple {
    let base = CheckpointConfig {
        thread_id: config.thread_id.clone(),
        checkpoint_ns: config.checkpoint_ns.clone(),
        checkpoint_id: None,
    };
    CheckpointTuple {
        config: base.clone().with_checkpoint(checkpoint_id),
        checkpoint,
        metadata,
        parent_config: parent_id.map(|p| base.with_checkpoint(p)),
        pending_writes,
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite 检查点存储（共享连接池）
#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: DbPool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

type CheckpointRow = (String, Option<String>, Vec<u8>, Vec<u8>);

fn decode_row(
    config: &CheckpointConfig,
    row: CheckpointRow,
    pending_writes: Vec<PendingWrite>,
) -> Result<CheckpointTuple, StoreError> {
    let (id, parent, cp_blob, meta_blob) = row;
    let checkpoint: Checkpoint = serde_json::from_slice(&cp_blob)?;
    let metadata: CheckpointMetadata = serde_json::from_slice(&meta_blob)?;
    Ok(tuple_from_parts(config, id, parent, checkpoint, metadata, pending_writes))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointConfig, StoreError> {
        let cp_blob = serde_json::to_vec(checkpoint)?;
        let meta_blob = serde_json::to_vec(metadata)?;
        let thread_id = config.thread_id.clone();
        let ns = config.checkpoint_ns.clone();
        let parent = config.checkpoint_id.clone();
        let id = checkpoint.id.clone();
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO checkpoints
                     (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![thread_id, ns, id, parent, cp_blob, meta_blob, now_micros()],
                )?;
                Ok(())
            })
            .await?;
        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<(), StoreError> {
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or(StoreError::MissingCheckpointId("put_writes"))?;
        let rows: Vec<(String, &'static str, Vec<u8>)> = writes
            .iter()
            .map(|(channel, value)| -> Result<_, StoreError> {
                Ok((channel.clone(), type_tag(value), serde_json::to_vec(value)?))
            })
            .collect::<Result<_, _>>()?;
        let thread_id = config.thread_id.clone();
        let ns = config.checkpoint_ns.clone();
        let task_id = task_id.to_string();
        self.pool
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let base: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(idx) + 1, 0) FROM checkpoint_writes
                     WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                    params![thread_id, ns, checkpoint_id],
                    |row| row.get(0),
                )?;
                let created_at = now_micros();
                for (i, (channel, tag, blob)) in rows.into_iter().enumerate() {
                    tx.execute(
                        "INSERT OR REPLACE INTO checkpoint_writes
                         (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, type, value, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            thread_id,
                            ns,
                            checkpoint_id,
                            task_id,
                            base + i as i64,
                            channel,
                            tag,
                            blob,
                            created_at
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let thread_id = config.thread_id.clone();
        let ns = config.checkpoint_ns.clone();
        let wanted = config.checkpoint_id.clone();
        let fetched = self
            .pool
            .with_conn(move |conn| {
                let row: Option<CheckpointRow> = match &wanted {
                    Some(id) => conn
                        .query_row(
                            "SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                             FROM checkpoints
                             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
                            params![thread_id, ns, id],
                            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            "SELECT checkpoint_id, parent_checkpoint_id, checkpoint, metadata
                             FROM checkpoints
                             WHERE thread_id = ?1 AND checkpoint_ns = ?2
                             ORDER BY created_at DESC, rowid DESC LIMIT 1",
                            params![thread_id, ns],
                            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                        )
                        .optional()?,
                };
                let Some(row) = row else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT task_id, idx, channel, type, value FROM checkpoint_writes
                     WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3
                     ORDER BY idx ASC",
                )?;
                let writes = stmt
                    .query_map(params![thread_id, ns, row.0], |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, i64>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, Option<String>>(3)?,
                            r.get::<_, Option<Vec<u8>>>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some((row, writes)))
            })
            .await?;

        let Some((row, raw_writes)) = fetched else {
            return Ok(None);
        };
        let pending_writes = raw_writes
            .into_iter()
            .map(|(task_id, idx, channel, tag, blob)| -> Result<_, StoreError> {
                let value = match blob {
                    Some(b) => serde_json::from_slice(&b)?,
                    None => Value::Null,
                };
                Ok(PendingWrite {
                    task_id,
                    idx,
                    channel,
                    type_tag: tag.unwrap_or_default(),
                    value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        decode_row(config, row, pending_writes).map(Some)
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>, StoreError> {
        let thread_id = config.thread_id.clone();
        let ns = config.checkpoint_ns.clone();
        let before = before.map(String::from);
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64;
        let rows = self
            .pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.checkpoint_id, c.parent_checkpoint_id, c.checkpoint, c.metadata
                     FROM checkpoints c
                     WHERE c.thread_id = ?1 AND c.checkpoint_ns = ?2
                       AND (?3 IS NULL OR EXISTS (
                           SELECT 1 FROM checkpoints b
                           WHERE b.thread_id = ?1 AND b.checkpoint_ns = ?2 AND b.checkpoint_id = ?3
                             AND (c.created_at < b.created_at
                                  OR (c.created_at = b.created_at AND c.rowid < b.rowid))))
                     ORDER BY c.created_at DESC, c.rowid DESC
                     LIMIT ?4",
                )?;
                let rows = stmt
                    .query_map(params![thread_id, ns, before, limit], |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                    })?
                    .collect::<Result<Vec<CheckpointRow>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter()
            .map(|row| decode_row(config, row, Vec::new()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// 内存实现（测试 / 无数据库时）
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    parent: Option<String>,
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
}

type ThreadKey = (String, String);

/// 进程内检查点存储；Vec 的插入顺序即创建顺序
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<ThreadKey, Vec<StoredCheckpoint>>>,
    writes: Mutex<HashMap<(String, String, String), Vec<PendingWrite>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err<T>(_: T) -> StoreError {
        StoreError::Pool("in-memory checkpoint store poisoned".to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointConfig, StoreError> {
        let mut map = self.checkpoints.lock().map_err(Self::lock_err)?;
        let entries = map
            .entry((config.thread_id.clone(), config.checkpoint_ns.clone()))
            .or_default();
        entries.retain(|c| c.checkpoint.id != checkpoint.id);
        entries.push(StoredCheckpoint {
            parent: config.checkpoint_id.clone(),
            checkpoint: checkpoint.clone(),
            metadata: metadata.clone(),
        });
        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<(), StoreError> {
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or(StoreError::MissingCheckpointId("put_writes"))?;
        let mut map = self.writes.lock().map_err(Self::lock_err)?;
        let list = map
            .entry((config.thread_id.clone(), config.checkpoint_ns.clone(), checkpoint_id))
            .or_default();
        let base = list.last().map(|w| w.idx + 1).unwrap_or(0);
        for (i, (channel, value)) in writes.iter().enumerate() {
            list.push(PendingWrite {
                task_id: task_id.to_string(),
                idx: base + i as i64,
                channel: channel.clone(),
                type_tag: type_tag(value).to_string(),
                value: value.clone(),
            });
        }
        Ok(())
    }

    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, StoreError> {
        let stored = {
            let map = self.checkpoints.lock().map_err(Self::lock_err)?;
            let Some(entries) = map.get(&(config.thread_id.clone(), config.checkpoint_ns.clone()))
            else {
                return Ok(None);
            };
            let found = match &config.checkpoint_id {
                Some(id) => entries.iter().find(|c| &c.checkpoint.id == id),
                None => entries.last(),
            };
            match found {
                Some(c) => c.clone(),
                None => return Ok(None),
            }
        };
        let pending_writes = self
            .writes
            .lock()
            .map_err(Self::lock_err)?
            .get(&(
                config.thread_id.clone(),
                config.checkpoint_ns.clone(),
                stored.checkpoint.id.clone(),
            ))
            .cloned()
            .unwrap_or_default();
        Ok(Some(tuple_from_parts(
            config,
            stored.checkpoint.id.clone(),
            stored.parent,
            stored.checkpoint,
            stored.metadata,
            pending_writes,
        )))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>, StoreError> {
        let map = self.checkpoints.lock().map_err(Self::lock_err)?;
        let Some(entries) = map.get(&(config.thread_id.clone(), config.checkpoint_ns.clone()))
        else {
            return Ok(Vec::new());
        };
        let end = match before {
            Some(id) => match entries.iter().position(|c| c.checkpoint.id == id) {
                Some(pos) => pos,
                None => return Ok(Vec::new()),
            },
            None => entries.len(),
        };
        Ok(entries[..end]
            .iter()
            .rev()
            .take(limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .map(|c| {
                tuple_from_parts(
                    config,
                    c.checkpoint.id.clone(),
                    c.parent.clone(),
                    c.checkpoint.clone(),
                    c.metadata.clone(),
                    Vec::new(),
                )
            })
            .collect())
    }
}
