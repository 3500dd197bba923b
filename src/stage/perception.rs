//! Perception Adapter：帧 -> 结构化观测（只描述所见，不提出动作）

use std::fmt::Write as _;
use std::sync::Arc;

use crate::core::StageFailure;
use crate::llm::{LlmClient, Message};
use crate::session::{FrameSubmission, Observation};
use crate::stage::contract::{contract_schema_json, Contract, PerceptionOutput};
use crate::stage::retry::RetryPolicy;
use crate::stage::validator::validate_perception;

const PERCEPTION_ROLE: &str = "You are a perception agent analyzing camera frames of a real-world task. \
Report only what you can actually see: visible objects, the current state of key objects, \
what changed since the last observation, readable text, and what you cannot see clearly. \
Never suggest actions or next steps.";

/// 感知调用的输入
pub struct FrameContext<'a> {
    pub goal: &'a str,
    /// 当前步骤标题（尚无步骤时为空）
    pub step_focus: Option<&'a str>,
    pub frame: &'a FrameSubmission,
    /// 滚动窗口中最近的观测
    pub recent: &'a [Arc<Observation>],
}

pub struct PerceptionAdapter {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl PerceptionAdapter {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub async fn perceive(&self, ctx: FrameContext<'_>) -> Result<PerceptionOutput, StageFailure> {
        let messages = vec![
            Message::system(format!(
                "{PERCEPTION_ROLE}\n\nOutput ONLY one JSON object matching this schema:\n{}",
                contract_schema_json(Contract::Perception)
            )),
            Message::user(build_prompt(&ctx)),
        ];
        self.retry
            .run(Contract::Perception, self.llm.as_ref(), messages, validate_perception)
            .await
    }
}

fn build_prompt(ctx: &FrameContext<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task goal: {}", ctx.goal);
    let _ = writeln!(
        prompt,
        "Current step focus: {}",
        ctx.step_focus.unwrap_or("Initial observation")
    );

    if let Some(last) = ctx.recent.last() {
        let _ = writeln!(prompt, "\nRecent observations:");
        for (i, obs) in ctx.recent.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", i + 1, obs.scene_summary);
        }
        let _ = writeln!(
            prompt,
            "Last accepted state: {}",
            serde_json::Value::Object(last.state_estimate.clone())
        );
    }

    let _ = writeln!(prompt, "\nFrame: {}", ctx.frame.image_ref);
    if let Some(transcript) = ctx.frame.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
        let _ = writeln!(prompt, "User said: {transcript}");
    }
    prompt
}
