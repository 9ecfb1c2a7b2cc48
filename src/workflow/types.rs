//! 工作流类型：节点、运行请求与结果

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::memory::Message;
use crate::workflow::state::RunState;

/// 状态机节点，入口为 Think，终态为 Done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Think,
    Tool,
    GenerateCode,
    Execute,
    Reflect,
    Synthesize,
    Lesson,
    Memory,
    Done,
}

impl Node {
    pub const ALL: [Node; 9] = [
        Node::Think,
        Node::Tool,
        Node::GenerateCode,
        Node::Execute,
        Node::Reflect,
        Node::Synthesize,
        Node::Lesson,
        Node::Memory,
        Node::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Think => "think",
            Node::Tool => "tool",
            Node::GenerateCode => "generate_code",
            Node::Execute => "execute",
            Node::Reflect => "reflect",
            Node::Synthesize => "synthesize",
            Node::Lesson => "lesson",
            Node::Memory => "memory",
            Node::Done => "done",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Node {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Node::ALL
            .iter()
            .find(|n| n.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown node '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Cancelled,
}

/// 一次用户回合
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub thread_id: String,
    pub task: String,
    pub history: Vec<Message>,
    pub memory: Vec<String>,
}

impl RunRequest {
    /// 新线程，id 随机生成
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            thread_id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            history: Vec::new(),
            memory: Vec::new(),
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_memory(mut self, memory: Vec<String>) -> Self {
        self.memory = memory;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub thread_id: String,
    pub status: RunStatus,
    pub state: RunState,
    /// 本次调用执行的节点数
    pub steps: usize,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn response(&self) -> &str {
        &self.state.response
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// 一个检查点的概要（history 查询用）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub checkpoint_id: String,
    pub ts: String,
    pub step: i64,
    pub node: Option<String>,
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_names_roundtrip() {
        for n in Node::ALL {
            assert_eq!(n.as_str().parse::<Node>(), Ok(n));
            assert_eq!(serde_json::to_value(n).unwrap(), n.as_str());
        }
        assert!("loop".parse::<Node>().is_err());
    }

    #[test]
    fn test_run_request_builder() {
        let a = RunRequest::new("t");
        let b = RunRequest::new("t");
        assert_ne!(a.thread_id, b.thread_id);
        let r = RunRequest::new("t")
            .with_thread("thread-1")
            .with_memory(vec!["m".into()]);
        assert_eq!(r.thread_id, "thread-1");
        assert_eq!(r.memory, ["m"]);
    }
}
