//! Coder：根据计划生成文件与执行命令

use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::reasoning::parse::{parse_generated_code, GeneratedCode};

const CODE_PROMPT: &str = r#"You write code files and the commands that run them in a sandbox.

Rules:
1. Python 3.12 is pre-installed. Do not use apt-get for standard library modules.
2. Use pip only for third-party packages.
3. The script must print clear, labeled output to stdout.
4. Indent Python with 4 spaces per level.

Check the context: if similar code worked before, adapt it instead of starting over.

Output every file in this exact marker format:
--- FILE: analysis.py ---
# code
print("Result:", value)
--- END FILE ---

Then finish with the commands as a JSON list:
COMMANDS: ["python3 analysis.py"]"#;

const MINIMAL_FIX_RULE: &str = "Previous attempts failed. Make the SMALLEST change that fixes the reported error. Do not rewrite the whole script.";

pub struct Coder {
    llm: Arc<dyn LlmClient>,
}

impl Coder {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 失败或无法解析时返回空的文件集与命令列表
    pub async fn generate(
        &self,
        task: &str,
        plan: &str,
        rag_context: &str,
        reflections: &[String],
    ) -> GeneratedCode {
        let mut system = CODE_PROMPT.to_string();
        if !reflections.is_empty() {
            system.push_str("\n\n");
            system.push_str(MINIMAL_FIX_RULE);
        }
        let reflections_text = if reflections.is_empty() {
            "None".to_string()
        } else {
            reflections.join("\n")
        };
        let context = if rag_context.is_empty() {
            "No similar past solutions."
        } else {
            rag_context
        };
        let user = format!(
            "Task:\n{}\n\nCode plan:\n{}\n\nContext:\n{}\n\nReflections:\n{}",
            task, plan, context, reflections_text
        );

        match self
            .llm
            .complete(&[Message::system(system), Message::user(user)])
            .await
        {
            Ok(raw) => {
                let code = parse_generated_code(&raw);
                tracing::info!(
                    files = ?code.files.keys().collect::<Vec<_>>(),
                    commands = ?code.commands,
                    "generated code"
                );
                code
            }
            Err(e) => {
                tracing::warn!(error = %e, "code generation failed");
                GeneratedCode::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_generate_parses_markers_and_commands() {
        let llm = Arc::new(ScriptedLlmClient::new([
            "--- FILE: main.py ---\nprint(1+1)\n--- END FILE ---\nCOMMANDS: [\"python3 main.py\"]",
        ]));
        let code = Coder::new(llm.clone())
            .generate("add", "print 1+1", "", &[])
            .await;
        assert_eq!(code.files["main.py"], "print(1+1)");
        assert_eq!(code.commands, vec!["python3 main.py"]);
        assert!(!llm.calls()[0][0].content.contains("SMALLEST"));
    }

    #[tokio::test]
    async fn test_reflections_switch_on_minimal_fix() {
        let llm = Arc::new(ScriptedLlmClient::new(["nothing useful"]));
        let code = Coder::new(llm.clone())
            .generate("add", "plan", "", &["NameError: x undefined".to_string()])
            .await;
        assert!(code.files.is_empty());
        let call = &llm.calls()[0];
        assert!(call[0].content.contains("SMALLEST"));
        assert!(call[1].content.contains("NameError: x undefined"));
    }

    #[tokio::test]
    async fn test_llm_error_yields_empty_code() {
        let code = Coder::new(Arc::new(ScriptedLlmClient::failing("boom")))
            .generate("t", "p", "", &[])
            .await;
        assert_eq!(code, GeneratedCode::default());
    }
}
