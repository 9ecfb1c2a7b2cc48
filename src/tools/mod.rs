//! 受信工具：绕过沙箱、直接在宿主上执行的后端操作
//!
//! 工具集合是封闭的枚举 `ToolName`；新增工具需要同时扩展 `ToolDispatcher::dispatch` 的 match。

pub mod dispatcher;
pub mod filesystem;
pub mod search;
pub mod shell;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use dispatcher::ToolDispatcher;
pub use filesystem::Workspace;
pub use search::SearchTools;
pub use shell::ShellRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SqlDb,
    RagSearch,
    SearchDocuments,
    ReadFile,
    WriteFile,
    EditFile,
    ListFiles,
    RunCommand,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::SqlDb,
        ToolName::RagSearch,
        ToolName::SearchDocuments,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::EditFile,
        ToolName::ListFiles,
        ToolName::RunCommand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::SqlDb => "sql_db",
            ToolName::RagSearch => "rag_search",
            ToolName::SearchDocuments => "search_documents",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::EditFile => "edit_file",
            ToolName::ListFiles => "list_files",
            ToolName::RunCommand => "run_command",
        }
    }

    /// 供 prompt 使用的一行说明
    pub fn description(&self) -> &'static str {
        match self {
            ToolName::SqlDb => r#"Run a read query against the agent database. Args: {"query": "SELECT ..."}"#,
            ToolName::RagSearch => r#"Search past solved tasks. Args: {"query": "..."}"#,
            ToolName::SearchDocuments => r#"Search uploaded documents. Args: {"query": "..."}"#,
            ToolName::ReadFile => {
                r#"Read a file, optional 1-indexed range. Args: {"path": "...", "start_line": 1, "end_line": 40}"#
            }
            ToolName::WriteFile => r#"Create or overwrite a file. Args: {"path": "...", "content": "..."}"#,
            ToolName::EditFile => {
                r#"Replace the first exact occurrence of old_text. Args: {"path": "...", "old_text": "...", "new_text": "..."}"#
            }
            ToolName::ListFiles => r#"List files recursively. Args: {"path": ".", "max_depth": 2}"#,
            ToolName::RunCommand => r#"Run a shell command on the host. Args: {"command": "...", "cwd": "optional"}"#,
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| format!("Unknown tool '{}'", s.trim()))
    }
}

/// prompt 中的 Available tools 段落
pub fn tool_catalog() -> String {
    ToolName::ALL
        .iter()
        .map(|t| format!("- {}: {}", t.as_str(), t.description()))
        .collect::<Vec<_>>()
        .join("\n")
}
