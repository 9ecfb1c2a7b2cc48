//! Synthesizer：把执行结果整理成最终回复

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::reasoning::critic::render_files;

const SYNTH_PROMPT: &str = "You ran code to get accurate data. Write a clear markdown response to the user's message that uses the execution results.\n\
Interpret and present the results; do not just dump raw output.\n\
If documents from the knowledge base were used, end with a line exactly like:\n\
Sources: [filename1], [filename2]";

#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub message: &'a str,
    pub code_plan: &'a str,
    pub execution_output: &'a str,
    pub files: &'a BTreeMap<String, String>,
    pub citations: &'a [String],
}

pub struct Synthesizer {
    llm: Arc<dyn LlmClient>,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(&self, input: SynthesisInput<'_>) -> String {
        let citations = if input.citations.is_empty() {
            "None".to_string()
        } else {
            input.citations.join(", ")
        };
        let user = format!(
            "Message:\n{}\n\nCode plan:\n{}\n\nExecution output:\n{}\n\nFiles:\n{}\n\nCitations:\n{}",
            input.message,
            input.code_plan,
            input.execution_output,
            render_files(input.files),
            citations
        );
        match self
            .llm
            .complete(&[Message::system(SYNTH_PROMPT), Message::user(user)])
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, returning raw output");
                format!("Code executed. Results:\n\n```\n{}\n```", input.execution_output)
            }
        }
    }
}
