//! 查询类工具：sql_db / rag_search / search_documents

use std::sync::Arc;

use crate::store::{truncate_chars, DbPool, KnowledgeStore};

const SEARCH_TOP_K: usize = 3;
const SNIPPET_CHARS: usize = 200;

/// 数据库与知识库查询
#[derive(Clone)]
pub struct SearchTools {
    pool: Option<DbPool>,
    knowledge: Arc<dyn KnowledgeStore>,
    sql_max_chars: usize,
}

impl SearchTools {
    pub fn new(
        pool: Option<DbPool>,
        knowledge: Arc<dyn KnowledgeStore>,
        sql_max_chars: usize,
    ) -> Self {
        Self {
            pool,
            knowledge,
            sql_max_chars,
        }
    }

    /// 执行查询，行以 JSON 数组返回；超长截断
    pub async fn sql(&self, query: &str) -> Result<String, String> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| "Database offline".to_string())?;
        let rows = pool
            .query_json(query)
            .await
            .map_err(|e| format!("SQL {}", e))?;
        if rows.is_empty() {
            return Ok("No results found.".to_string());
        }
        let text = serde_json::to_string_pretty(&rows).map_err(|e| e.to_string())?;
        if text.chars().count() > self.sql_max_chars {
            Ok(format!(
                "{}\n... (truncated)",
                truncate_chars(&text, self.sql_max_chars)
            ))
        } else {
            Ok(text)
        }
    }

    pub async fn similar_solutions(&self, query: &str) -> Result<String, String> {
        let results = self
            .knowledge
            .retrieve_similar(query, SEARCH_TOP_K)
            .await
            .map_err(|e| e.to_string())?;
        if results.is_empty() {
            return Ok("No similar solutions found.".to_string());
        }
        Ok(results
            .iter()
            .map(|r| {
                format!(
                    "Task: {}\nCode Snippet: {}...\nResult: {}...",
                    r.task,
                    truncate_chars(&r.code, SNIPPET_CHARS),
                    truncate_chars(&r.result, SNIPPET_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n"))
    }

    pub async fn documents(&self, query: &str) -> Result<String, String> {
        let results = self
            .knowledge
            .retrieve_documents(query, SEARCH_TOP_K)
            .await
            .map_err(|e| e.to_string())?;
        if results.is_empty() {
            return Ok("No relevant documents found.".to_string());
        }
        Ok(results
            .iter()
            .map(|d| format!("--- Source: {} ---\n{}", d.filename, d.content))
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
