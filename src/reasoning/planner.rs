//! Planner：决定下一步（直接回复 / 调用工具 / 生成代码）；QueryExpander：检索查询改写
//!
//! LLM 调用失败时降级为固定回复，从不向工作流报错。

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::conversation::render_history;
use crate::memory::Message;
use crate::reasoning::parse::{parse_query_lines, parse_think_output, ThinkDecision};
use crate::tools::tool_catalog;

pub const PLANNER_FALLBACK: &str = "I encountered an error. Could you try rephrasing?";

const THINK_PROMPT: &str = r#"You are an autonomous assistant with a Python 3.12 sandbox, direct backend tools and memory.

Decide the next step:
1. Need information? Use a direct tool first (sql_db, rag_search, read_file, list_files).
2. Need to edit or create a host file? Use edit_file for precise edits or write_file for new files.
3. Need computation? Set needs_code to "yes" and describe the code in code_plan.
4. Have the answer? Respond directly (needs_code "no", tool_choice "none").

Direct tools (bypass the sandbox):
{tools}

Set tool_choice to "none" when no direct tool is needed.
If you use information from rag_search or search_documents, list the filenames in citations.
The context may contain PAST LESSONS. Follow them strictly.

Reply with ONE JSON object and nothing else:
{"thinking": "...", "needs_code": "yes|no", "tool_choice": "<tool or none>", "tool_args": {...}, "citations": [], "code_plan": "... or N/A", "response": "markdown answer when no code and no tool"}"#;

const QUERY_PROMPT: &str = "Generate improved search queries for retrieving past solutions and notes.\n\
Write 3 distinct queries, one per line, no numbering:\n\
1. keyword focused (e.g. python dataframe merge)\n\
2. concept focused (e.g. how to combine datasets)\n\
3. error or issue focused, if applicable";

/// think 阶段的输入
#[derive(Debug, Clone, Copy)]
pub struct ThinkInput<'a> {
    pub message: &'a str,
    pub history: &'a [Message],
    pub memory: &'a [String],
    pub rag_context: &'a str,
}

/// 推理协作者
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    history_window: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, history_window: usize) -> Self {
        Self {
            llm,
            history_window,
        }
    }

    pub async fn decide(&self, input: ThinkInput<'_>) -> ThinkDecision {
        let history = render_history(input.history, self.history_window)
            .unwrap_or_else(|| "No previous conversation.".to_string());
        let memory = if input.memory.is_empty() {
            "No memories yet.".to_string()
        } else {
            input
                .memory
                .iter()
                .map(|f| format!("• {}", f))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let context = if input.rag_context.is_empty() {
            "No similar past solutions."
        } else {
            input.rag_context
        };

        let user = format!(
            "Message:\n{}\n\nHistory:\n{}\n\nMemory:\n{}\n\nContext:\n{}",
            input.message, history, memory, context
        );
        let messages = [
            Message::system(THINK_PROMPT.replace("{tools}", &tool_catalog())),
            Message::user(user),
        ];

        match self.llm.complete(&messages).await {
            Ok(raw) => {
                let decision = parse_think_output(&raw);
                tracing::debug!(
                    needs_code = decision.needs_code(),
                    tool = ?decision.tool(),
                    citations = decision.citations.len(),
                    "planner decision"
                );
                decision
            }
            Err(e) => {
                tracing::warn!(error = %e, "planner call failed");
                ThinkDecision::fallback(format!("Error during thinking: {}", e), PLANNER_FALLBACK)
            }
        }
    }
}

/// 检索查询改写：最多 3 条，失败时退回原任务
pub struct QueryExpander {
    llm: Arc<dyn LlmClient>,
}

impl QueryExpander {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn expand(&self, task: &str, history: &[Message]) -> Vec<String> {
        let history = render_history(history, 3).unwrap_or_default();
        let messages = [
            Message::system(QUERY_PROMPT),
            Message::user(format!("Task:\n{}\n\nHistory:\n{}", task, history)),
        ];
        match self.llm.complete(&messages).await {
            Ok(raw) => parse_query_lines(&raw, task),
            Err(e) => {
                tracing::warn!(error = %e, "query expansion failed");
                vec![task.to_string()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::reasoning::parse::NextAction;
    use crate::tools::ToolName;

    #[tokio::test]
    async fn test_decide_tool_call() {
        let llm = Arc::new(ScriptedLlmClient::new([
            r#"{"thinking": "look first", "needs_code": "no", "tool_choice": "list_files", "tool_args": "{\"path\": \".\"}", "response": ""}"#,
        ]));
        let planner = Planner::new(llm.clone(), 10);
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let decision = planner
            .decide(ThinkInput {
                message: "what files are here?",
                history: &history,
                memory: &["likes rust".to_string()],
                rag_context: "",
            })
            .await;
        assert_eq!(decision.tool(), Some(ToolName::ListFiles));
        assert_eq!(decision.tool_args()["path"], ".");

        let prompt = &llm.calls()[0][1].content;
        assert!(prompt.contains("[user]: hi\n[assistant]: hello"));
        assert!(prompt.contains("• likes rust"));
        assert!(prompt.contains("No similar past solutions."));
    }

    #[tokio::test]
    async fn test_decide_degrades_on_llm_error() {
        let planner = Planner::new(Arc::new(ScriptedLlmClient::failing("timeout")), 10);
        let decision = planner
            .decide(ThinkInput {
                message: "x",
                history: &[],
                memory: &[],
                rag_context: "",
            })
            .await;
        assert_eq!(decision.action, NextAction::Respond);
        assert_eq!(decision.response, PLANNER_FALLBACK);
        assert!(decision.thinking.contains("timeout"));
    }

    #[tokio::test]
    async fn test_history_window_applies() {
        let llm = Arc::new(ScriptedLlmClient::new(["{}"]));
        let planner = Planner::new(llm.clone(), 2);
        let history: Vec<Message> = (0..5).map(|i| Message::user(format!("m{}", i))).collect();
        planner
            .decide(ThinkInput {
                message: "x",
                history: &history,
                memory: &[],
                rag_context: "ctx",
            })
            .await;
        let prompt = &llm.calls()[0][1].content;
        assert!(!prompt.contains("m2"));
        assert!(prompt.contains("[user]: m3\n[user]: m4"));
    }

    #[tokio::test]
    async fn test_expand_queries() {
        let expander = QueryExpander::new(Arc::new(ScriptedLlmClient::new([
            "- csv merge pandas\n- combine two tables\n- KeyError on merge\n- extra",
        ])));
        let queries = expander.expand("merge csv files", &[]).await;
        assert_eq!(
            queries,
            vec!["csv merge pandas", "combine two tables", "KeyError on merge"]
        );

        let failing = QueryExpander::new(Arc::new(ScriptedLlmClient::failing("down")));
        assert_eq!(failing.expand("merge csv files", &[]).await, vec!["merge csv files"]);
    }
}
