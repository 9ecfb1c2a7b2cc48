//! Critic：分析失败的执行日志，给出最小修复建议
//!
//! 送给模型前先去掉依赖安装的噪音输出。

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::sandbox::{is_install_noise, LogEntry, LogKind};

const CRITIC_PROMPT: &str = "You analyze code execution failures and give a precise fix.\n\
Include:\n\
1. What the code was supposed to do\n\
2. The actual error\n\
3. The root cause\n\
4. The EXACT minimal code change needed";

pub struct Critic {
    llm: Arc<dyn LlmClient>,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn critique(
        &self,
        files: &BTreeMap<String, String>,
        commands: &[String],
        logs: &[LogEntry],
    ) -> String {
        let user = format!(
            "Files:\n{}\n\nCommands:\n{}\n\nExecution logs:\n{}",
            render_files(files),
            serde_json::to_string(commands).unwrap_or_default(),
            serde_json::to_string_pretty(&relevant_logs(logs)).unwrap_or_default()
        );
        match self
            .llm
            .complete(&[Message::system(CRITIC_PROMPT), Message::user(user)])
            .await
        {
            Ok(critique) => critique.trim().to_string(),
            Err(e) => {
                tracing::warn!(error = %e, "critique failed");
                format!("Error: {}", e)
            }
        }
    }
}

/// `\n--- name ---\ncontent\n` 逐个拼接
pub(crate) fn render_files(files: &BTreeMap<String, String>) -> String {
    files
        .iter()
        .map(|(name, content)| format!("\n--- {} ---\n{}\n", name, content))
        .collect()
}

/// 去掉 stdout / stderr 中的包管理器进度输出
fn relevant_logs(logs: &[LogEntry]) -> Vec<&LogEntry> {
    logs.iter()
        .filter(|l| {
            !(matches!(l.kind, LogKind::Stdout | LogKind::Stderr) && is_install_noise(&l.content))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_noise_filtered_from_prompt() {
        let llm = Arc::new(ScriptedLlmClient::new(["  Define x before use.  "]));
        let critic = Critic::new(llm.clone());
        let files = BTreeMap::from([("main.py".to_string(), "print(x)".to_string())]);
        let logs = vec![
            LogEntry::new(LogKind::Stdout, "Unpacking libfoo (1.0) ..."),
            LogEntry::new(LogKind::Stderr, "NameError: name 'x' is not defined"),
            LogEntry::new(LogKind::Error, "Exit code 1"),
        ];
        let out = critic
            .critique(&files, &["python3 main.py".to_string()], &logs)
            .await;
        assert_eq!(out, "Define x before use.");

        let prompt = &llm.calls()[0][1].content;
        assert!(prompt.contains("\n--- main.py ---\nprint(x)\n"));
        assert!(prompt.contains("NameError"));
        assert!(!prompt.contains("Unpacking libfoo"));
        assert!(prompt.contains(r#"["python3 main.py"]"#));
    }

    #[tokio::test]
    async fn test_llm_error_becomes_critique_text() {
        let critic = Critic::new(Arc::new(ScriptedLlmClient::failing("rate limited")));
        let out = critic.critique(&BTreeMap::new(), &[], &[]).await;
        assert_eq!(out, "Error: rate limited");
    }
}
