//! 知识库：历史方案、短期事实、自我改进教训、上传文档
//!
//! 向量以 JSON 数组存入 SQLite，检索时在进程内按 L2 距离排序。
//! 写入方案 / 事实前先查最近邻，距离低于阈值视为重复并跳过。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::llm::Embedder;
use crate::store::{truncate_chars, DbPool, StoreError};

/// 方案去重阈值（L2）
pub const SOLUTION_DEDUP_DISTANCE: f32 = 0.2;
/// 事实去重阈值（L2）
pub const MEMORY_DEDUP_DISTANCE: f32 = 0.15;

const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionRecord {
    pub task: String,
    pub code: String,
    pub result: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub filename: String,
    pub content: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonRecord {
    pub prompt: String,
    pub response: String,
    pub lesson: String,
    pub distance: f32,
}

/// 检索 / 写入接口；多个运行并发读取，写入只做插入
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn retrieve_similar(&self, query: &str, k: usize)
        -> Result<Vec<SolutionRecord>, StoreError>;
    async fn retrieve_documents(&self, query: &str, k: usize)
        -> Result<Vec<DocumentChunk>, StoreError>;
    async fn retrieve_memories(&self, query: &str, k: usize) -> Result<Vec<String>, StoreError>;
    async fn retrieve_recent_memories(&self, k: usize) -> Result<Vec<String>, StoreError>;
    async fn retrieve_lessons(&self, query: &str, k: usize)
        -> Result<Vec<LessonRecord>, StoreError>;

    /// 返回 false 表示近似重复而跳过
    async fn store_solution(&self, task: &str, code: &str, result: &str)
        -> Result<bool, StoreError>;
    /// 返回 false 表示近似重复而跳过
    async fn store_memory(&self, fact: &str) -> Result<bool, StoreError>;
    async fn store_lesson(&self, prompt: &str, response: &str, lesson: &str)
        -> Result<(), StoreError>;
    /// 返回写入的分块数
    async fn store_document(&self, filename: &str, content: &str) -> Result<usize, StoreError>;
}

/// 按字符切分，相邻块重叠 `overlap` 个字符
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += step;
    }
    chunks
}

/// 把检索结果拼成 think 阶段的上下文块
pub fn format_rag_context(
    solutions: &[SolutionRecord],
    memories: &[String],
    documents: &[DocumentChunk],
    lessons: &[LessonRecord],
) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !lessons.is_empty() {
        parts.push("=== PAST LESSONS (SELF-IMPROVEMENT) ===".to_string());
        for l in lessons {
            parts.push(format!("• PAST PROMPT: {}", l.prompt));
            parts.push(format!("  LESSON LEARNED: {}", l.lesson));
        }
        parts.push(String::new());
    }

    if !memories.is_empty() {
        parts.push("=== RELEVANT MEMORIES ===".to_string());
        for m in memories {
            parts.push(format!("• {}", m));
        }
        parts.push(String::new());
    }

    if !documents.is_empty() {
        parts.push("=== RELEVANT DOCUMENT CHUNKS ===".to_string());
        for d in documents {
            parts.push(format!("\n--- From '{}' ---", d.filename));
            parts.push(d.content.clone());
        }
        parts.push(String::new());
    }

    if !solutions.is_empty() {
        parts.push("=== SIMILAR PAST SOLUTIONS ===".to_string());
        for (i, s) in solutions.iter().enumerate() {
            parts.push(format!("\n--- Solution {} (distance: {:.4}) ---", i + 1, s.distance));
            parts.push(format!("Task: {}", s.task));
            parts.push(format!("Code:\n{}", truncate_chars(&s.code, 2000)));
            parts.push(format!("Result: {}", truncate_chars(&s.result, 200)));
        }
    } else if memories.is_empty() && documents.is_empty() && lessons.is_empty() {
        parts.push("No similar past solutions found.".to_string());
    }

    parts.join("\n")
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// 按距离升序取前 k 个
fn nearest<T>(mut scored: Vec<(f32, T)>, k: usize) -> Vec<(f32, T)> {
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));
    scored.truncate(k);
    scored
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite 知识库：嵌入由注入的 Embedder 计算
pub struct SqliteKnowledgeStore {
    pool: DbPool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteKnowledgeStore {
    pub fn new(pool: DbPool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, StoreError> {
        self.embedder.embed(text).await.map_err(StoreError::Embedding)
    }

    /// 读取某表全部行（embedding 列在最后），解析向量并与查询计算距离
    async fn scan<T, F>(&self, sql: &'static str, query: Vec<f32>, map: F)
        -> Result<Vec<(f32, T)>, StoreError>
    where
        T: Send + 'static,
        F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<(T, String)> + Send + 'static,
    {
        self.pool
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map([], |r| map(r))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows
                    .into_iter()
                    .map(|(item, emb)| {
                        let v: Vec<f32> = serde_json::from_str(&emb).unwrap_or_default();
                        (l2(&query, &v), item)
                    })
                    .collect())
            })
            .await
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[async_trait]
impl KnowledgeStore for SqliteKnowledgeStore {
    async fn retrieve_similar(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<SolutionRecord>, StoreError> {
        let q = self.embed(query).await?;
        let scored = self
            .scan("SELECT task, code, result, embedding FROM solutions", q, |r| {
                Ok(((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?), r.get(3)?))
            })
            .await?;
        Ok(nearest(scored, k)
            .into_iter()
            .map(|(distance, (task, code, result))| SolutionRecord {
                task,
                code,
                result,
                distance,
            })
            .collect())
    }

    async fn retrieve_documents(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<DocumentChunk>, StoreError> {
        let q = self.embed(query).await?;
        let scored = self
            .scan("SELECT filename, content, embedding FROM documents", q, |r| {
                Ok(((r.get::<_, String>(0)?, r.get::<_, String>(1)?), r.get(2)?))
            })
            .await?;
        Ok(nearest(scored, k)
            .into_iter()
            .map(|(distance, (filename, content))| DocumentChunk {
                filename,
                content,
                distance,
            })
            .collect())
    }

    async fn retrieve_memories(&self, query: &str, k: usize) -> Result<Vec<String>, StoreError> {
        let q = self.embed(query).await?;
        let scored = self
            .scan("SELECT fact, embedding FROM memories", q, |r| {
                Ok((r.get::<_, String>(0)?, r.get(1)?))
            })
            .await?;
        Ok(nearest(scored, k).into_iter().map(|(_, f)| f).collect())
    }

    async fn retrieve_recent_memories(&self, k: usize) -> Result<Vec<String>, StoreError> {
        self.pool
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT fact FROM memories ORDER BY created_at DESC, id DESC LIMIT ?1")?;
                let facts = stmt
                    .query_map(params![k as i64], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(facts)
            })
            .await
    }

    async fn retrieve_lessons(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<LessonRecord>, StoreError> {
        let q = self.embed(query).await?;
        let scored = self
            .scan("SELECT prompt, response, lesson, embedding FROM lessons", q, |r| {
                Ok(((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?), r.get(3)?))
            })
            .await?;
        Ok(nearest(scored, k)
            .into_iter()
            .map(|(distance, (prompt, response, lesson))| LessonRecord {
                prompt,
                response,
                lesson,
                distance,
            })
            .collect())
    }

    async fn store_solution(
        &self,
        task: &str,
        code: &str,
        result: &str,
    ) -> Result<bool, StoreError> {
        let task = truncate_chars(task, 2000);
        let emb = self.embed(&task).await?;
        let existing = self
            .scan("SELECT task, embedding FROM solutions", emb.clone(), |r| {
                Ok((r.get::<_, String>(0)?, r.get(1)?))
            })
            .await?;
        if let Some((dist, _)) = nearest(existing, 1).first() {
            if *dist < SOLUTION_DEDUP_DISTANCE {
                tracing::info!(distance = %dist, "skipping duplicate solution");
                return Ok(false);
            }
        }
        let code = truncate_chars(code, 10_000);
        let result = truncate_chars(result, 5000);
        let emb_json = serde_json::to_string(&emb)?;
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO solutions (task, code, result, embedding, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![task, code, result, emb_json, now()],
                )?;
                Ok(())
            })
            .await?;
        Ok(true)
    }

    async fn store_memory(&self, fact: &str) -> Result<bool, StoreError> {
        let fact = truncate_chars(fact.trim(), 2000);
        if fact.is_empty() {
            return Ok(false);
        }
        let emb = self.embed(&fact).await?;
        let existing = self
            .scan("SELECT fact, embedding FROM memories", emb.clone(), |r| {
                Ok((r.get::<_, String>(0)?, r.get(1)?))
            })
            .await?;
        if let Some((dist, _)) = nearest(existing, 1).first() {
            if *dist < MEMORY_DEDUP_DISTANCE {
                tracing::debug!(distance = %dist, "skipping duplicate fact");
                return Ok(false);
            }
        }
        let emb_json = serde_json::to_string(&emb)?;
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO memories (fact, embedding, created_at) VALUES (?1, ?2, ?3)",
                    params![fact, emb_json, now()],
                )?;
                Ok(())
            })
            .await?;
        Ok(true)
    }

    async fn store_lesson(
        &self,
        prompt: &str,
        response: &str,
        lesson: &str,
    ) -> Result<(), StoreError> {
        let prompt = truncate_chars(prompt, 2000);
        let response = truncate_chars(response, 5000);
        let lesson = truncate_chars(lesson, 2000);
        let emb = self.embed(&format!("{} {}", prompt, lesson)).await?;
        let emb_json = serde_json::to_string(&emb)?;
        self.pool
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO lessons (prompt, response, lesson, embedding, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![prompt, response, lesson, emb_json, now()],
                )?;
                Ok(())
            })
            .await
    }

    async fn store_document(&self, filename: &str, content: &str) -> Result<usize, StoreError> {
        let chunks = chunk_text(content, CHUNK_SIZE, CHUNK_OVERLAP);
        let mut rows = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let emb = self.embed(&chunk).await?;
            rows.push((chunk, serde_json::to_string(&emb)?));
        }
        let filename = filename.to_string();
        let count = rows.len();
        self.pool
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let created_at = now();
                for (i, (chunk, emb)) in rows.into_iter().enumerate() {
                    tx.execute(
                        "INSERT INTO documents (filename, chunk_index, content, embedding, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![filename, i as i64, chunk, emb, created_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        tracing::info!(chunks = count, "indexed document");
        Ok(count)
    }
}

/// 不连知识库时使用：检索为空，写入直接丢弃
#[derive(Debug, Default, Clone)]
pub struct NoopKnowledge;

#[async_trait]
impl KnowledgeStore for NoopKnowledge {
    async fn retrieve_similar(&self, _: &str, _: usize) -> Result<Vec<SolutionRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn retrieve_documents(&self, _: &str, _: usize) -> Result<Vec<DocumentChunk>, StoreError> {
        Ok(Vec::new())
    }

    async fn retrieve_memories(&self, _: &str, _: usize) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn retrieve_recent_memories(&self, _: usize) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn retrieve_lessons(&self, _: &str, _: usize) -> Result<Vec<LessonRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn store_solution(&self, _: &str, _: &str, _: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn store_memory(&self, _: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn store_lesson(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn store_document(&self, _: &str, _: &str) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;

    fn store() -> SqliteKnowledgeStore {
        SqliteKnowledgeStore::new(
            DbPool::in_memory().unwrap(),
            Arc::new(HashingEmbedder::default()),
        )
    }

    #[test]
    fn test_chunk_text_overlap() {
        let text: String = "a".repeat(2500);
        let chunks = chunk_text(&text, 1000, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[1].len(), 1000);
        assert_eq!(chunks[2].len(), 700);
        assert!(chunk_text("", 1000, 100).is_empty());
    }

    #[test]
    fn test_format_empty_context() {
        assert_eq!(
            format_rag_context(&[], &[], &[], &[]),
            "No similar past solutions found."
        );
    }

    #[test]
    fn test_format_sections_in_order() {
        let ctx = format_rag_context(
            &[SolutionRecord {
                task: "sum".into(),
                code: "print(1+1)".into(),
                result: "2".into(),
                distance: 0.5,
            }],
            &["user likes python".to_string()],
            &[],
            &[LessonRecord {
                prompt: "p".into(),
                response: "r".into(),
                lesson: "check inputs".into(),
                distance: 0.1,
            }],
        );
        let lessons = ctx.find("=== PAST LESSONS").unwrap();
        let memories = ctx.find("=== RELEVANT MEMORIES").unwrap();
        let solutions = ctx.find("=== SIMILAR PAST SOLUTIONS").unwrap();
        assert!(lessons < memories && memories < solutions);
        assert!(ctx.contains("--- Solution 1 (distance: 0.5000) ---"));
        assert!(ctx.contains("LESSON LEARNED: check inputs"));
        assert!(!ctx.contains("No similar past solutions found."));
    }

    #[tokio::test]
    async fn test_solution_dedup() {
        let kb = store();
        assert!(kb.store_solution("add two numbers", "print(1+1)", "2").await.unwrap());
        assert!(!kb.store_solution("add two numbers", "print(2)", "2").await.unwrap());
        assert!(kb
            .store_solution("download a web page and count links", "x", "y")
            .await
            .unwrap());
        let hits = kb.retrieve_similar("add two numbers", 3).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].task, "add two numbers");
        assert!(hits[0].distance < 1e-4);
    }

    #[tokio::test]
    async fn test_memory_dedup_and_recent_order() {
        let kb = store();
        assert!(kb.store_memory("user prefers metric units").await.unwrap());
        assert!(!kb.store_memory("user prefers metric units").await.unwrap());
        assert!(kb.store_memory("project is called tinker").await.unwrap());
        let recent = kb.retrieve_recent_memories(5).await.unwrap();
        assert_eq!(recent, vec!["project is called tinker", "user prefers metric units"]);
    }

    #[tokio::test]
    async fn test_documents_and_lessons() {
        let kb = store();
        let n = kb
            .store_document("notes.txt", "the deployment uses port 8080")
            .await
            .unwrap();
        assert_eq!(n, 1);
        let docs = kb.retrieve_documents("deployment port", 3).await.unwrap();
        assert_eq!(docs[0].filename, "notes.txt");

        kb.store_lesson("sum numbers", "4", "print labeled output").await.unwrap();
        let lessons = kb.retrieve_lessons("sum numbers", 2).await.unwrap();
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].lesson, "print labeled output");
    }
}
