//! 核心：引擎级错误

pub mod error;

pub use error::AgentError;
