//! SQLite 连接池
//!
//! 基于 deadpool managed 池：容量有界，每次取出连接前执行 `SELECT 1` 健康检查，
//! 失败的连接被丢弃并重建。rusqlite 调用在 spawn_blocking 中执行，不阻塞运行时。

use std::path::{Path, PathBuf};
use std::time::Duration;

use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};

use crate::store::StoreError;

/// 建表语句：检查点、挂起写入、指标、知识库
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL DEFAULT '',
    checkpoint_id TEXT NOT NULL,
    parent_checkpoint_id TEXT,
    checkpoint BLOB NOT NULL,
    metadata BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_created
    ON checkpoints(thread_id, checkpoint_ns, created_at);
CREATE TABLE IF NOT EXISTS checkpoint_writes (
    thread_id TEXT NOT NULL,
    checkpoint_ns TEXT NOT NULL DEFAULT '',
    checkpoint_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    channel TEXT NOT NULL,
    type TEXT,
    value BLOB,
    created_at TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, idx)
);
CREATE TABLE IF NOT EXISTS agent_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id TEXT NOT NULL,
    task TEXT NOT NULL,
    success INTEGER NOT NULL,
    duration_ms REAL NOT NULL,
    error_type TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    iteration_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS solutions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task TEXT NOT NULL,
    code TEXT NOT NULL,
    result TEXT NOT NULL,
    embedding TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fact TEXT NOT NULL,
    embedding TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS lessons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt TEXT NOT NULL,
    response TEXT NOT NULL,
    lesson TEXT NOT NULL,
    embedding TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// 连接来源：文件或进程内存
#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory,
}

/// deadpool 管理器：负责建连与取出前健康检查
#[derive(Debug)]
pub struct SqliteManager {
    target: Target,
}

impl SqliteManager {
    fn open(&self) -> Result<Connection, rusqlite::Error> {
        let conn = match &self.target {
            Target::File(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )?,
            Target::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(Duration::from_secs(5))?;
        if matches!(self.target, Target::File(_)) {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }
}

impl managed::Manager for SqliteManager {
    type Type = Connection;
    type Error = rusqlite::Error;

    async fn create(&self) -> Result<Connection, rusqlite::Error> {
        self.open()
    }

    async fn recycle(&self, conn: &mut Connection, _: &Metrics) -> RecycleResult<rusqlite::Error> {
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(RecycleError::Backend)
    }
}

type Pool = managed::Pool<SqliteManager>;

/// 进程持有的有界连接池，克隆即共享
#[derive(Clone)]
pub struct DbPool {
    pool: Pool,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("DbPool")
            .field("max_size", &status.max_size)
            .field("size", &status.size)
            .finish()
    }
}

impl DbPool {
    /// 打开数据库文件（父目录不存在时创建），最多 `max_size` 个连接
    pub fn open(path: impl AsRef<Path>, max_size: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Pool(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        Self::build(Target::File(path), max_size.max(1))
    }

    /// 进程内存数据库：单连接（每个内存连接是独立库）
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::build(Target::Memory, 1)
    }

    fn build(target: Target, max_size: usize) -> Result<Self, StoreError> {
        let pool = Pool::builder(SqliteManager { target })
            .max_size(max_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    /// 取出一个健康连接，在阻塞线程池中执行 `f`
    pub async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        tokio::task::spawn_blocking(move || f(&mut conn))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// 执行只读查询，每行转为 JSON 对象（列名 → 值）
    pub async fn query_json(&self, sql: &str) -> Result<Vec<Value>, StoreError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = Map::new();
                for (i, name) in columns.iter().enumerate() {
                    obj.insert(name.clone(), sql_value_to_json(row.get_ref(i)?));
                }
                out.push(Value::Object(obj));
            }
            Ok(out)
        })
        .await
    }
}

fn sql_value_to_json(v: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_bootstrapped_on_checkout() {
        let pool = DbPool::in_memory().unwrap();
        let rows = pool
            .query_json("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .unwrap();
        let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
        for table in ["checkpoints", "checkpoint_writes", "agent_metrics", "solutions"] {
            assert!(names.contains(&table), "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_query_json_maps_columns() {
        let pool = DbPool::in_memory().unwrap();
        let rows = pool.query_json("SELECT 1 AS one, 'x' AS name").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["one"], 1);
        assert_eq!(rows[0]["name"], "x");
    }

    #[tokio::test]
    async fn test_bad_sql_is_an_error() {
        let pool = DbPool::in_memory().unwrap();
        assert!(pool.query_json("SELEKT nope").await.is_err());
    }

    #[tokio::test]
    async fn test_file_pool_shares_data_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DbPool::open(dir.path().join("nested/t.db"), 4).unwrap();
        pool.with_conn(|c| {
            c.execute("CREATE TABLE t (v INTEGER)", [])?;
            c.execute("INSERT INTO t VALUES (7)", [])?;
            Ok(())
        })
        .await
        .unwrap();
        let rows = pool.query_json("SELECT v FROM t").await.unwrap();
        assert_eq!(rows[0]["v"], 7);
    }
}
