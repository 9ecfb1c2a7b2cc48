//! 运行过程事件：节点进出、沙箱日志、工具结果，供 CLI / 前端流式展示

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::sandbox::LogEntry;
use crate::tools::ToolName;
use crate::workflow::types::Node;

/// 单个事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    NodeStarted { node: Node, step: i64 },
    NodeFinished { node: Node, next: Node },
    /// 沙箱日志，按产生顺序实时转发
    Log { entry: LogEntry },
    /// 工具返回（预览，避免过长）
    ToolResult { tool: ToolName, preview: String },
    Failed { error: String },
    Done { response: String },
}

pub type EventSender = UnboundedSender<WorkflowEvent>;

/// 接收端已关闭时静默丢弃
pub(crate) fn send_event(tx: Option<&EventSender>, ev: WorkflowEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
