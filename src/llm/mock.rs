//! Mock LLM 客户端（用于演示与测试，无需 API）
//!
//! - MockLlmClient：按 system prompt 识别阶段，返回合法的固定 JSON，便于本地跑通整条流程
//! - ScriptedLlmClient：按顺序回放预设回复，并记录调用次数与收到的消息

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// 从 User 消息中取 `Key: value` 行
fn field<'a>(messages: &'a [Message], key: &str) -> Option<&'a str> {
    messages
        .iter()
        .filter(|m| matches!(m.role, Role::User))
        .flat_map(|m| m.content.lines())
        .find_map(|line| line.strip_prefix(key).map(str::trim))
}

/// Mock 客户端：感知回显帧引用；规划总是给出「展示当前状态」的步骤；
/// 核验时证据引用含 blurry 判 unclear，含 wrong 判 fail，否则 pass
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let system = messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        if system.contains("perception agent") {
            let frame = field(messages, "Frame:").unwrap_or("(no frame)");
            return Ok(serde_json::json!({
                "scene_summary": format!("Frame {frame}"),
                "state_estimate": { "frame": frame },
                "state_delta": {},
                "uncertainties": []
            })
            .to_string());
        }

        if system.contains("verification agent") {
            let evidence = field(messages, "Evidence:").unwrap_or("");
            let reply = if evidence.contains("blurry") {
                serde_json::json!({
                    "verdict": "unclear",
                    "reason": "The evidence image is too blurry to judge",
                    "request_new_evidence": "Hold the camera steady and add more light"
                })
            } else if evidence.contains("wrong") {
                serde_json::json!({
                    "verdict": "fail",
                    "reason": "The expected state is not visible",
                    "correction": "Repeat the instruction and show me again"
                })
            } else {
                serde_json::json!({ "verdict": "pass", "reason": "Looks right" })
            };
            return Ok(reply.to_string());
        }

        Ok(serde_json::json!({
            "next_step": {
                "title": "Show your setup",
                "instruction": "Show me the current state of your setup",
                "success_criteria": [{ "subject": "setup", "expected": "fully visible" }],
                "verification_request": "Take one photo of the whole setup"
            },
            "message": "Let's take it one small step at a time."
        })
        .to_string())
    }
}

/// 预设回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// 模拟传输错误
    Error(String),
    /// 延迟后返回（用于超时与并发测试）
    Delayed(Duration, String),
}

impl ScriptedReply {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

/// 脚本化客户端：按顺序回放，脚本耗尽时返回错误
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// 追加一条文本回复
    pub fn push_text(&self, text: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(ScriptedReply::Text(text.into()));
        }
    }

    /// 已发生的调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 最近一次调用收到的消息
    pub fn last_prompt(&self) -> Option<Vec<Message>> {
        self.prompts.lock().ok().and_then(|p| p.last().cloned())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        let next = self
            .replies
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front();
        match next {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Error(e)) => Err(e),
            Some(ScriptedReply::Delayed(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            None => Err("script exhausted".to_string()),
        }
    }
}
