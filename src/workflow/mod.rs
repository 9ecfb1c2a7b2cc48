//! 工作流：状态机路由、按字段合并的运行状态、检查点驱动的引擎

pub mod builder;
pub mod engine;
pub mod events;
pub mod graph;
pub mod state;
pub mod types;

pub use builder::{Collaborator, EngineBuilder};
pub use engine::{RunOptions, WorkflowEngine, RETRIEVAL_ERROR_CONTEXT, TOOL_LIMIT_MESSAGE};
pub use events::{EventSender, WorkflowEvent};
pub use graph::{next_node, Bounds};
pub use state::{Field, MergeStrategy, RunState, StatePatch, RESET_CHANNEL};
pub use types::{Node, RunOutcome, RunRequest, RunStatus, StepRecord};
