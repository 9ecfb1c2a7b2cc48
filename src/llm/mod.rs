//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Scripted）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, OpenAiEmbedder};
pub use mock::{HashingEmbedder, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::{Embedder, LlmClient};
