//! Planner Adapter：滚动窗口 + 新观测 + 回答 -> 下一个决策
//!
//! 窗口中的观测以 `Arc` 借入，Adapter 只读取不复制。

use std::fmt::Write as _;
use std::sync::Arc;

use crate::core::StageFailure;
use crate::llm::{LlmClient, Message};
use crate::session::{AnsweredQuestion, Observation, Question, Step};
use crate::stage::contract::{contract_schema_json, CoachOutput, Contract};
use crate::stage::retry::RetryPolicy;
use crate::stage::validator::validate_coach;

const COACH_ROLE: &str = "You are a coaching agent guiding someone through a physical, multi-step task. \
Decide the NEXT SINGLE micro-step, or ask one clarifying question, or declare the task complete. \
Every step needs checkable success criteria naming an object and its expected state. \
Add safety warnings whenever something could hurt the user or damage an item. \
Be concise, clear, and encouraging. Break complex tasks into tiny steps.";

/// 规划调用的输入
pub struct PlanningContext<'a> {
    pub goal: &'a str,
    pub language: &'a str,
    pub window: &'a [Arc<Observation>],
    /// 本次帧的观测（尚未提交到存储）
    pub incoming: Option<&'a Observation>,
    pub active_step: Option<&'a Step>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub answers: &'a [AnsweredQuestion],
    /// 正在回答的问题与回答内容
    pub pending_answer: Option<(&'a Question, &'a str)>,
}

pub struct PlannerAdapter {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl PlannerAdapter {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub async fn plan(&self, ctx: PlanningContext<'_>) -> Result<CoachOutput, StageFailure> {
        let messages = vec![
            Message::system(format!(
                "{COACH_ROLE}\nReply to the user in {}.\n\nOutput ONLY one JSON object matching this schema \
                 (set at most one of next_step, question, task_complete):\n{}",
                ctx.language,
                contract_schema_json(Contract::Coach)
            )),
            Message::user(build_prompt(&ctx)),
        ];
        self.retry
            .run(Contract::Coach, self.llm.as_ref(), messages, validate_coach)
            .await
    }
}

fn describe_observation(prompt: &mut String, label: &str, obs: &Observation) {
    let _ = writeln!(prompt, "{label} #{}: {}", obs.sequence, obs.scene_summary);
    let _ = writeln!(
        prompt,
        "  State: {}",
        serde_json::Value::Object(obs.state_estimate.clone())
    );
    if !obs.state_delta.is_empty() {
        let _ = writeln!(
            prompt,
            "  Changes: {}",
            serde_json::Value::Object(obs.state_delta.clone())
        );
    }
    if let Some(transcript) = &obs.transcript {
        let _ = writeln!(prompt, "  User said: {transcript}");
    }
}

fn build_prompt(ctx: &PlanningContext<'_>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Task goal: {}", ctx.goal);
    let _ = writeln!(
        prompt,
        "Progress: {} of {} planned steps verified",
        ctx.completed_steps, ctx.total_steps
    );

    match ctx.active_step {
        Some(step) => {
            let _ = writeln!(prompt, "Active step: {} ({})", step.title, step.instruction);
            if let Some(correction) = step.last_correction() {
                let _ = writeln!(prompt, "  Last correction: {correction}");
            }
        }
        None => {
            let _ = writeln!(prompt, "Active step: none");
        }
    }

    if !ctx.window.is_empty() {
        let _ = writeln!(prompt, "\nRecent observations:");
        for obs in ctx.window {
            describe_observation(&mut prompt, "Observation", obs);
        }
    }
    if let Some(obs) = ctx.incoming {
        let _ = writeln!(prompt);
        describe_observation(&mut prompt, "Latest observation", obs);
    }

    if !ctx.answers.is_empty() {
        let _ = writeln!(prompt, "\nUser answers so far:");
        for a in ctx.answers {
            let _ = writeln!(prompt, "- Q: {} A: {}", a.question, a.answer);
        }
    }
    if let Some((question, answer)) = ctx.pending_answer {
        let _ = writeln!(prompt, "\nThe user just answered \"{}\": {}", question.text, answer);
    }
    prompt
}
