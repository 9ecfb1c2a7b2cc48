//! 推理协作者：决策、查询改写、代码生成、失败分析、结果综合、反思与事实抽取
//!
//! 每个协作者持有一个 `Arc<dyn LlmClient>`；模型失败一律降级为默认输出，不向工作流报错。

pub mod coder;
pub mod critic;
pub mod learner;
pub mod parse;
pub mod planner;
pub mod synthesizer;

pub use coder::Coder;
pub use critic::Critic;
pub use learner::Learner;
pub use parse::{GeneratedCode, NextAction, ThinkDecision};
pub use planner::{Planner, QueryExpander, ThinkInput, PLANNER_FALLBACK};
pub use synthesizer::{SynthesisInput, Synthesizer};
