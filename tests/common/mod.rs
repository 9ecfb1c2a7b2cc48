//! 集成测试共用：脚本化模型、假容器运行时、引擎装配

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use tinker::config::AppConfig;
use tinker::llm::ScriptedLlmClient;
use tinker::sandbox::{ContainerRuntime, ContainerSpec, ExecOutput, SandboxError};
use tinker::store::CheckpointStore;
use tinker::workflow::{Collaborator, EngineBuilder, WorkflowEngine};

pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn failed(stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 1,
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// 按命令文本返回预置输出；同一命令的队列只剩一条时重复它
#[derive(Default)]
pub struct FakeRuntime {
    outputs: Mutex<HashMap<String, VecDeque<ExecOutput>>>,
    hanging: Vec<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, command: &str, outputs: Vec<ExecOutput>) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(command.to_string(), outputs.into());
        self
    }

    /// 该命令永不返回
    pub fn hang(mut self, command: &str) -> Self {
        self.hanging.push(command.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.log(format!("image {}", image));
        Ok(())
    }

    async fn start(&self, _spec: &ContainerSpec) -> Result<String, SandboxError> {
        self.log("start".into());
        Ok("c1".into())
    }

    async fn put_archive(&self, id: &str, dest: &str, _: Vec<u8>) -> Result<(), SandboxError> {
        self.log(format!("put {}:{}", id, dest));
        Ok(())
    }

    async fn exec(&self, _id: &str, _workdir: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        self.log(format!("exec {}", command));
        if command.starts_with("find ") {
            return Ok(ok("./main.py\n"));
        }
        if self.hanging.iter().any(|c| c == command) {
            std::future::pending::<()>().await;
        }
        let mut outputs = self.outputs.lock().unwrap();
        Ok(match outputs.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => ExecOutput::default(),
        })
    }

    async fn get_archive(&self, _id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        Err(SandboxError::Spawn(format!("no artifact at {}", path)))
    }

    async fn remove(&self, id: &str) -> Result<(), SandboxError> {
        self.log(format!("rm {}", id));
        Ok(())
    }
}

/// 每个协作者一条独立脚本
pub struct Scripts {
    pub planner: Arc<ScriptedLlmClient>,
    pub expander: Arc<ScriptedLlmClient>,
    pub coder: Arc<ScriptedLlmClient>,
    pub critic: Arc<ScriptedLlmClient>,
    pub synthesizer: Arc<ScriptedLlmClient>,
    pub learner: Arc<ScriptedLlmClient>,
}

impl Scripts {
    pub fn new(planner: &[&str], coder: &[&str]) -> Self {
        Self {
            planner: Arc::new(ScriptedLlmClient::new(planner.iter().copied())),
            expander: Arc::new(ScriptedLlmClient::new(["similar task"])),
            coder: Arc::new(ScriptedLlmClient::new(coder.iter().copied())),
            critic: Arc::new(ScriptedLlmClient::new(["Define the missing variable."])),
            synthesizer: Arc::new(ScriptedLlmClient::new(["The answer is **2**."])),
            learner: Arc::new(ScriptedLlmClient::new(["Check variable names first.", "NONE"])),
        }
    }
}

pub struct Harness {
    pub engine: WorkflowEngine,
    pub runtime: Arc<FakeRuntime>,
    pub workspace: TempDir,
    _artifacts: TempDir,
}

pub fn harness(
    scripts: &Scripts,
    runtime: FakeRuntime,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
) -> Harness {
    let workspace = TempDir::new().unwrap();
    let artifacts = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.sandbox.artifact_dir = artifacts.path().to_path_buf();

    let runtime = Arc::new(runtime);
    let mut builder = EngineBuilder::new(config, workspace.path().to_path_buf())
        .with_collaborator_llm(Collaborator::Planner, scripts.planner.clone())
        .with_collaborator_llm(Collaborator::QueryExpander, scripts.expander.clone())
        .with_collaborator_llm(Collaborator::Coder, scripts.coder.clone())
        .with_collaborator_llm(Collaborator::Critic, scripts.critic.clone())
        .with_collaborator_llm(Collaborator::Synthesizer, scripts.synthesizer.clone())
        .with_collaborator_llm(Collaborator::Learner, scripts.learner.clone())
        .with_llm(Arc::new(ScriptedLlmClient::failing("unexpected collaborator")))
        .with_runtime(runtime.clone());
    if let Some(store) = checkpoints {
        builder = builder.with_checkpoints(store);
    }
    Harness {
        engine: builder.build(),
        runtime,
        workspace,
        _artifacts: artifacts,
    }
}

pub const CODE_DECISION: &str = r#"{"thinking": "I should compute it in Python", "needs_code": "yes", "tool_choice": "none", "tool_args": "{}", "citations": "[]", "code_plan": "print 1+1", "response": ""}"#;

pub const ONE_PLUS_ONE: &str = "--- FILE: main.py ---\nprint(1+1)\n--- END FILE ---\nCOMMANDS: [\"python3 main.py\"]";

pub const DIRECT_ANSWER: &str = r#"{"thinking": "simple greeting", "needs_code": "no", "tool_choice": "none", "tool_args": "{}", "citations": "[]", "code_plan": "N/A", "response": "Hello!"}"#;
