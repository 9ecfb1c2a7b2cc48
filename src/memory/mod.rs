//! 记忆层：对话历史（短期事实与教训见 store::knowledge）

pub mod conversation;

pub use conversation::{Message, Role};
