//! 离线客户端（用于测试，无需 API）
//!
//! ScriptedLlmClient 按顺序返回预置回复，耗尽后重复最后一条；HashingEmbedder 用词袋哈希生成固定维度向量。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{Embedder, LlmClient};
use crate::memory::Message;

/// 按脚本回复的客户端，并记录每次收到的消息
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|s| Ok(s.into())).collect()),
            ..Default::default()
        }
    }

    /// 每次调用都失败
    pub fn failing(reason: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(reason.to_string())])),
            ..Default::default()
        }
    }

    /// 追加一条回复
    pub fn push(&self, reply: impl Into<String>) {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(Ok(reply.into()));
        }
    }

    /// 已收到的全部请求（按调用顺序）
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(messages.to_vec());
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(reply) => {
                if let Ok(mut last) = self.last.lock() {
                    *last = Some(reply.clone());
                }
                reply
            }
            None => self
                .last
                .lock()
                .ok()
                .and_then(|l| l.clone())
                .unwrap_or_else(|| Err("script exhausted".to_string())),
        }
    }
}

/// 词袋哈希嵌入：相同词集得到相同向量，便于离线测试去重与检索
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        let mut v = vec![0.0f32; self.dims];
        for word in text.split_whitespace() {
            let mut h = DefaultHasher::new();
            word.to_lowercase().hash(&mut h);
            v[(h.finish() as usize) % self.dims] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_in_order_then_repeat_last() {
        let client = ScriptedLlmClient::new(["a", "b"]);
        let msgs = [Message::user("x")];
        assert_eq!(client.complete(&msgs).await.unwrap(), "a");
        assert_eq!(client.complete(&msgs).await.unwrap(), "b");
        assert_eq!(client.complete(&msgs).await.unwrap(), "b");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_client_always_errors() {
        let client = ScriptedLlmClient::failing("down");
        let msgs = [Message::user("x")];
        assert_eq!(client.complete(&msgs).await.unwrap_err(), "down");
        assert_eq!(client.complete(&msgs).await.unwrap_err(), "down");
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed("print one plus one").await.unwrap();
        let b = e.embed("print one plus one").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
