//! LLM 层：消息格式、客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化测试客户端）

pub mod message;
pub mod mock;
pub mod openai;
pub mod traits;

pub use message::{Message, Role};
pub use mock::{MockLlmClient, ScriptedLlmClient, ScriptedReply};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::LlmClient;
