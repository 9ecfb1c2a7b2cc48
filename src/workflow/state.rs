//! 运行状态与按字段合并
//!
//! 节点只产出部分更新（`StatePatch`），引擎按通道名逐条合并进 `RunState`。
//! 合并策略由 `Field::strategy` 这张表决定：`files` 取并集（同名覆盖），
//! `execution_logs` / `reflections` / `memory` 只追加，其余字段整体覆盖。

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;
use crate::sandbox::LogEntry;
use crate::tools::ToolName;

/// 回合边界的清空写入
pub const RESET_CHANNEL: &str = "__reset__";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub task: String,
    pub history: Vec<Message>,
    pub memory: Vec<String>,

    pub thinking: String,
    pub needs_code: bool,
    pub tool_choice: Option<ToolName>,
    pub tool_args: Value,
    pub code_plan: String,
    pub response: String,
    pub rag_context: String,

    pub files: BTreeMap<String, String>,
    pub commands: Vec<String>,
    pub execution_logs: Vec<LogEntry>,
    /// stdout 拼接
    pub execution_result: String,
    /// error / stderr 拼接
    pub execution_error: String,

    pub reflections: Vec<String>,
    /// 最近一次教训
    pub reflection: String,
    pub iteration: u32,
    pub tool_usage_count: u32,
    pub is_solved: bool,

    pub citations: Vec<String>,
    /// 产物文件名 → 宿主机路径
    pub retrieved_files: BTreeMap<String, PathBuf>,
}

impl RunState {
    pub fn new(task: impl Into<String>, history: Vec<Message>, memory: Vec<String>) -> Self {
        Self {
            task: task.into(),
            history,
            memory,
            ..Default::default()
        }
    }

    /// 按顺序合并一组通道写入；未知通道记 warn 后忽略
    pub fn apply_writes(&mut self, writes: &[(String, Value)]) -> Result<(), serde_json::Error> {
        for (channel, value) in writes {
            if channel == RESET_CHANNEL {
                self.reset_turn();
                continue;
            }
            match channel.parse::<Field>() {
                Ok(field) => self.merge(field, value.clone())?,
                Err(_) => tracing::warn!(channel = %channel, "ignoring write to unknown channel"),
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, field: Field, value: Value) -> Result<(), serde_json::Error> {
        let strategy = field.strategy();
        match field {
            Field::Task => overwrite(&mut self.task, value),
            Field::History => merge_list(&mut self.history, value, strategy),
            Field::Memory => merge_list(&mut self.memory, value, strategy),
            Field::Thinking => overwrite(&mut self.thinking, value),
            Field::NeedsCode => overwrite(&mut self.needs_code, value),
            Field::ToolChoice => overwrite(&mut self.tool_choice, value),
            Field::ToolArgs => {
                self.tool_args = value;
                Ok(())
            }
            Field::CodePlan => overwrite(&mut self.code_plan, value),
            Field::Response => overwrite(&mut self.response, value),
            Field::RagContext => overwrite(&mut self.rag_context, value),
            Field::Files => merge_map(&mut self.files, value, strategy),
            Field::Commands => merge_list(&mut self.commands, value, strategy),
            Field::ExecutionLogs => merge_list(&mut self.execution_logs, value, strategy),
            Field::ExecutionResult => overwrite(&mut self.execution_result, value),
            Field::ExecutionError => overwrite(&mut self.execution_error, value),
            Field::Reflections => merge_list(&mut self.reflections, value, strategy),
            Field::Reflection => overwrite(&mut self.reflection, value),
            Field::Iteration => overwrite(&mut self.iteration, value),
            Field::ToolUsageCount => overwrite(&mut self.tool_usage_count, value),
            Field::IsSolved => overwrite(&mut self.is_solved, value),
            Field::Citations => merge_list(&mut self.citations, value, strategy),
            Field::RetrievedFiles => merge_map(&mut self.retrieved_files, value, strategy),
        }
    }

    /// 新回合开始：清空执行周期内只增不减的通道
    pub fn reset_turn(&mut self) {
        self.files.clear();
        self.commands.clear();
        self.execution_logs.clear();
        self.execution_result.clear();
        self.execution_error.clear();
        self.retrieved_files.clear();
        self.reflections.clear();
        self.iteration = 0;
    }
}

fn overwrite<T: DeserializeOwned>(slot: &mut T, value: Value) -> Result<(), serde_json::Error> {
    *slot = serde_json::from_value(value)?;
    Ok(())
}

fn merge_list<T: DeserializeOwned>(
    slot: &mut Vec<T>,
    value: Value,
    strategy: MergeStrategy,
) -> Result<(), serde_json::Error> {
    let items: Vec<T> = serde_json::from_value(value)?;
    match strategy {
        MergeStrategy::Append | MergeStrategy::Union => slot.extend(items),
        MergeStrategy::Overwrite => *slot = items,
    }
    Ok(())
}

fn merge_map<V: DeserializeOwned>(
    slot: &mut BTreeMap<String, V>,
    value: Value,
    strategy: MergeStrategy,
) -> Result<(), serde_json::Error> {
    let entries: BTreeMap<String, V> = serde_json::from_value(value)?;
    match strategy {
        MergeStrategy::Union | MergeStrategy::Append => slot.extend(entries),
        MergeStrategy::Overwrite => *slot = entries,
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Overwrite,
    /// 映射并集，同名键以新值为准
    Union,
    Append,
}

/// 状态通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Task,
    History,
    Memory,
    Thinking,
    NeedsCode,
    ToolChoice,
    ToolArgs,
    CodePlan,
    Response,
    RagContext,
    Files,
    Commands,
    ExecutionLogs,
    ExecutionResult,
    ExecutionError,
    Reflections,
    Reflection,
    Iteration,
    ToolUsageCount,
    IsSolved,
    Citations,
    RetrievedFiles,
}

impl Field {
    pub const ALL: [Field; 22] = [
        Field::Task,
        Field::History,
        Field::Memory,
        Field::Thinking,
        Field::NeedsCode,
        Field::ToolChoice,
        Field::ToolArgs,
        Field::CodePlan,
        Field::Response,
        Field::RagContext,
        Field::Files,
        Field::Commands,
        Field::ExecutionLogs,
        Field::ExecutionResult,
        Field::ExecutionError,
        Field::Reflections,
        Field::Reflection,
        Field::Iteration,
        Field::ToolUsageCount,
        Field::IsSolved,
        Field::Citations,
        Field::RetrievedFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Task => "task",
            Field::History => "history",
            Field::Memory => "memory",
            Field::Thinking => "thinking",
            Field::NeedsCode => "needs_code",
            Field::ToolChoice => "tool_choice",
            Field::ToolArgs => "tool_args",
            Field::CodePlan => "code_plan",
            Field::Response => "response",
            Field::RagContext => "rag_context",
            Field::Files => "files",
            Field::Commands => "commands",
            Field::ExecutionLogs => "execution_logs",
            Field::ExecutionResult => "execution_result",
            Field::ExecutionError => "execution_error",
            Field::Reflections => "reflections",
            Field::Reflection => "reflection",
            Field::Iteration => "iteration",
            Field::ToolUsageCount => "tool_usage_count",
            Field::IsSolved => "is_solved",
            Field::Citations => "citations",
            Field::RetrievedFiles => "retrieved_files",
        }
    }

    pub fn strategy(&self) -> MergeStrategy {
        match self {
            Field::Files => MergeStrategy::Union,
            Field::ExecutionLogs | Field::Reflections | Field::Memory => MergeStrategy::Append,
            _ => MergeStrategy::Overwrite,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown channel '{}'", s))
    }
}

/// 节点产出的部分更新，按追加顺序转成通道写入
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    writes: Vec<(String, Value)>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(mut self, field: Field, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.writes.push((field.as_str().to_string(), v)),
            Err(e) => tracing::warn!(field = %field, error = %e, "dropping unserializable write"),
        }
        self
    }

    pub fn reset_turn(mut self) -> Self {
        self.writes.push((RESET_CHANNEL.to_string(), Value::Null));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<(String, Value)> {
        self.writes
    }
}
