//! Retry Policy：一次调用，失败后带修正提示重试一次，再失败则 StageFailure
//!
//! 三个 Adapter 共用。超时与传输错误与 SchemaError 一样计入 2 次调用预算；从不伪造默认结果。

use std::time::Duration;

use tracing::{debug, warn};

use crate::core::{SchemaError, StageFailure};
use crate::llm::{LlmClient, Message};
use crate::stage::contract::{contract_schema_json, Contract};

/// 每个逻辑操作最多的外部调用次数
pub const MAX_STAGE_CALLS: u32 = 2;

/// 单次调用失败的原因
#[derive(Debug)]
enum AttemptFailure {
    Schema(SchemaError),
    Timeout(Duration),
    Transport(String),
}

impl AttemptFailure {
    fn describe(&self) -> String {
        match self {
            AttemptFailure::Schema(e) => e.to_string(),
            AttemptFailure::Timeout(d) => format!("call timed out after {}s", d.as_secs()),
            AttemptFailure::Transport(e) => format!("transport error: {e}"),
        }
    }

    fn raw(&self) -> Option<String> {
        match self {
            AttemptFailure::Schema(e) => Some(e.raw.clone()),
            _ => None,
        }
    }
}

/// 重试时追加到上下文的修正提示
fn amendment(contract: Contract, failure: &AttemptFailure) -> String {
    let problem = match failure {
        AttemptFailure::Schema(e) => format!("Your previous reply was rejected: {}.", e.reason),
        AttemptFailure::Timeout(_) => "Your previous reply took too long.".to_string(),
        AttemptFailure::Transport(_) => "The previous request did not complete.".to_string(),
    };
    format!(
        "{problem} Reply again with ONLY one JSON object for the {contract} contract, \
         with no markdown and no other text. It must match this JSON schema:\n{}",
        contract_schema_json(contract)
    )
}

/// 统一的单次重试策略（按契约参数化）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn run<T, F>(
        &self,
        contract: Contract,
        llm: &dyn LlmClient,
        mut messages: Vec<Message>,
        validate: F,
    ) -> Result<T, StageFailure>
    where
        F: Fn(&str) -> Result<T, SchemaError>,
    {
        let mut last: Option<AttemptFailure> = None;

        for attempt in 1..=MAX_STAGE_CALLS {
            if let Some(failure) = &last {
                messages.push(Message::user(amendment(contract, failure)));
            }

            let failure = match tokio::time::timeout(self.call_timeout, llm.complete(&messages)).await
            {
                Ok(Ok(raw)) => match validate(&raw) {
                    Ok(value) => {
                        let (prompt_tokens, completion_tokens, total_tokens) = llm.token_usage();
                        debug!(
                            %contract,
                            attempt,
                            prompt_tokens,
                            completion_tokens,
                            total_tokens,
                            "stage output accepted"
                        );
                        return Ok(value);
                    }
                    Err(e) => AttemptFailure::Schema(e),
                },
                Ok(Err(e)) => AttemptFailure::Transport(e),
                Err(_) => AttemptFailure::Timeout(self.call_timeout),
            };

            warn!(%contract, attempt, error = %failure.describe(), "stage call failed");
            last = Some(failure);
        }

        let (last_error, raw) = last
            .map(|f| (f.describe(), f.raw()))
            .unwrap_or_else(|| ("no call made".to_string(), None));
        Err(StageFailure {
            contract,
            attempts: MAX_STAGE_CALLS,
            last_error,
            raw,
        })
    }
}
