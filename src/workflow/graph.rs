//! 路由：当前节点 + 合并后的状态 → 下一节点

use crate::config::WorkflowSection;
use crate::workflow::state::RunState;
use crate::workflow::types::Node;

/// 迭代与工具调用上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    /// 生成-执行周期上限，达到后强制综合
    pub max_iterations: u32,
    /// 每回合工具调用上限
    pub max_tool_calls: u32,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_tool_calls: 3,
        }
    }
}

impl From<&WorkflowSection> for Bounds {
    fn from(w: &WorkflowSection) -> Self {
        Self {
            max_iterations: w.max_iterations,
            max_tool_calls: w.max_tool_calls,
        }
    }
}

pub fn next_node(current: Node, state: &RunState, bounds: &Bounds) -> Node {
    match current {
        Node::Think => {
            if state.needs_code {
                Node::GenerateCode
            } else if state.tool_choice.is_some() {
                if state.tool_usage_count >= bounds.max_tool_calls {
                    Node::Lesson
                } else {
                    Node::Tool
                }
            } else {
                Node::Lesson
            }
        }
        Node::Tool => Node::Think,
        Node::GenerateCode => Node::Execute,
        Node::Execute => {
            if state.is_solved || state.iteration >= bounds.max_iterations {
                Node::Synthesize
            } else {
                Node::Reflect
            }
        }
        Node::Reflect => Node::GenerateCode,
        Node::Synthesize => Node::Lesson,
        Node::Lesson => Node::Memory,
        Node::Memory | Node::Done => Node::Done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolName;

    fn route(current: Node, f: impl FnOnce(&mut RunState)) -> Node {
        let mut state = RunState::default();
        f(&mut state);
        next_node(current, &state, &Bounds::default())
    }

    #[test]
    fn test_think_routes() {
        assert_eq!(route(Node::Think, |s| s.needs_code = true), Node::GenerateCode);
        assert_eq!(
            route(Node::Think, |s| {
                s.needs_code = true;
                s.tool_choice = Some(ToolName::SqlDb);
            }),
            Node::GenerateCode
        );
        assert_eq!(
            route(Node::Think, |s| s.tool_choice = Some(ToolName::ReadFile)),
            Node::Tool
        );
        assert_eq!(
            route(Node::Think, |s| {
                s.tool_choice = Some(ToolName::ReadFile);
                s.tool_usage_count = 3;
            }),
            Node::Lesson
        );
        assert_eq!(route(Node::Think, |_| {}), Node::Lesson);
    }

    #[test]
    fn test_execute_routes() {
        assert_eq!(
            route(Node::Execute, |s| {
                s.is_solved = true;
                s.iteration = 1;
            }),
            Node::Synthesize
        );
        assert_eq!(route(Node::Execute, |s| s.iteration = 2), Node::Reflect);
        assert_eq!(route(Node::Execute, |s| s.iteration = 3), Node::Synthesize);
    }

    #[test]
    fn test_fixed_edges() {
        assert_eq!(route(Node::Tool, |_| {}), Node::Think);
        assert_eq!(route(Node::GenerateCode, |_| {}), Node::Execute);
        assert_eq!(route(Node::Reflect, |_| {}), Node::GenerateCode);
        assert_eq!(route(Node::Synthesize, |_| {}), Node::Lesson);
        assert_eq!(route(Node::Lesson, |_| {}), Node::Memory);
        assert_eq!(route(Node::Memory, |_| {}), Node::Done);
    }

    #[test]
    fn test_custom_bounds() {
        let bounds = Bounds {
            max_iterations: 1,
            max_tool_calls: 0,
        };
        let mut state = RunState {
            iteration: 1,
            ..Default::default()
        };
        assert_eq!(next_node(Node::Execute, &state, &bounds), Node::Synthesize);
        state.tool_choice = Some(ToolName::ListFiles);
        assert_eq!(next_node(Node::Think, &state, &bounds), Node::Lesson);
    }
}
