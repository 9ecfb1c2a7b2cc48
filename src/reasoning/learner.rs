//! Learner：回合结束后的自我反思（教训）与事实抽取

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::reasoning::parse::parse_fact_lines;
use crate::store::truncate_chars;

const LESSON_PROMPT: &str = "Review the user's prompt and the assistant's response and give constructive feedback.\n\
Consider missing details or edge cases, better tool usage (e.g. SQL instead of Python), code quality and clarity.\n\
Reply with one concise lesson answering: next time, how will I do this better?";

const FACTS_PROMPT: &str = "Extract key facts from this conversation turn worth remembering later.\n\
Only important, reusable facts: user preferences and constraints, key results or numbers, names and projects, decisions made.\n\
No conversational filler and nothing already in memory.\n\
Write one fact per line, or NONE if nothing is worth remembering.";

pub struct Learner {
    llm: Arc<dyn LlmClient>,
}

impl Learner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 失败或模型给出空内容时返回 None
    pub async fn lesson(&self, task: &str, response: &str, execution_output: &str) -> Option<String> {
        let user = format!(
            "Prompt:\n{}\n\nResponse:\n{}\n\nExecution output:\n{}",
            task,
            truncate_chars(response, 5000),
            truncate_chars(execution_output, 5000)
        );
        match self
            .llm
            .complete(&[Message::system(LESSON_PROMPT), Message::user(user)])
            .await
        {
            Ok(lesson) => {
                let lesson = lesson.trim();
                (!lesson.is_empty()).then(|| lesson.to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "lesson reflection failed");
                None
            }
        }
    }

    pub async fn extract_facts(&self, task: &str, response: &str, memory: &[String]) -> Vec<String> {
        let existing = if memory.is_empty() {
            "Empty".to_string()
        } else {
            memory.join("\n")
        };
        let user = format!(
            "User message:\n{}\n\nAssistant response:\n{}\n\nExisting memory:\n{}",
            task,
            truncate_chars(response, 2000),
            existing
        );
        match self
            .llm
            .complete(&[Message::system(FACTS_PROMPT), Message::user(user)])
            .await
        {
            Ok(raw) => parse_fact_lines(&raw),
            Err(e) => {
                tracing::warn!(error = %e, "fact extraction failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_lesson() {
        let llm = Arc::new(ScriptedLlmClient::new(["  Use SQL for counts.  ", "   "]));
        let learner = Learner::new(llm.clone());
        assert_eq!(
            learner.lesson("count rows", &"r".repeat(6000), "42").await.as_deref(),
            Some("Use SQL for counts.")
        );
        // 回复被截断到 5000 字符
        assert!(!llm.calls()[0][1].content.contains(&"r".repeat(5001)));
        assert_eq!(learner.lesson("t", "r", "").await, None);

        let failing = Learner::new(Arc::new(ScriptedLlmClient::failing("x")));
        assert_eq!(failing.lesson("t", "r", "").await, None);
    }

    #[tokio::test]
    async fn test_extract_facts() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "• User prefers pandas\n- Project is called atlas\nNONE",
            "NONE",
        ]));
        let learner = Learner::new(llm.clone());
        let facts = learner.extract_facts("t", "r", &[]).await;
        assert_eq!(facts, vec!["User prefers pandas", "Project is called atlas"]);
        assert!(llm.calls()[0][1].content.contains("Existing memory:\nEmpty"));

        assert!(learner.extract_facts("t", "r", &facts).await.is_empty());
    }
}
