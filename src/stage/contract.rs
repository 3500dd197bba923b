//! 三个推理阶段的输出契约
//!
//! `*Wire` 结构对应模型应输出的原始 JSON（同时用 schemars 生成 Schema 注入 prompt）；
//! 校验通过后归一化为 PerceptionOutput / CoachOutput / VerifierOutput。

use std::fmt;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 契约名（与阶段一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contract {
    Perception,
    Coach,
    Verifier,
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Contract::Perception => "perception",
            Contract::Coach => "coach",
            Contract::Verifier => "verifier",
        };
        f.write_str(name)
    }
}

/// 结构化成功标准：某个对象应处于的状态（如 dial -> delicate）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SuccessCriterion {
    /// 被检查的对象，如 dial、door、detergent drawer
    pub subject: String,
    /// 期望状态，如 "set to delicate"
    pub expected: String,
}

/// 问题期望的回答形态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerShape {
    FreeText,
    YesNo,
    Choice { options: Vec<String> },
}

/// 核验结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    Unclear,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Unclear => "unclear",
        };
        f.write_str(name)
    }
}

/// 感知阶段归一化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionOutput {
    pub scene_summary: String,
    pub state_estimate: Map<String, Value>,
    pub state_delta: Map<String, Value>,
    pub uncertainties: Vec<String>,
    pub salient_objects: Vec<String>,
    pub readable_text: Option<String>,
}

/// Planner 给出的新步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    pub title: String,
    pub instruction: String,
    pub success_criteria: Vec<SuccessCriterion>,
    pub verification_request: Option<String>,
    /// 该步骤通过后任务即完成
    pub completes_task: bool,
}

/// Planner 提出的澄清问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPlan {
    pub text: String,
    pub shape: AnswerShape,
}

/// Planner 的决策（互斥）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoachDecision {
    NextStep(StepPlan),
    Question(QuestionPlan),
    TaskComplete,
    /// 只有安全警告，没有其它决策
    SafetyOnly,
}

/// Planner 阶段归一化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachOutput {
    pub decision: CoachDecision,
    pub safety_warnings: Vec<String>,
    pub message: Option<String>,
}

/// 核验阶段归一化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierOutput {
    pub verdict: Verdict,
    pub reason: String,
    /// 仅 fail 时存在，且只有一条
    pub correction: Option<String>,
    /// 仅 unclear 时存在：需要怎样的新证据（角度 / 光线）
    pub evidence_request: Option<String>,
}

/// 感知阶段原始输出格式
#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct PerceptionWire {
    /// Brief factual description of what is visible
    pub scene_summary: String,
    /// Current state of key objects, e.g. {"dial": "cotton", "door": "closed"}
    pub state_estimate: Map<String, Value>,
    /// What changed since the last accepted observation; {} when nothing changed
    pub state_delta: Map<String, Value>,
    /// What cannot be seen clearly
    #[serde(default)]
    pub uncertainties: Option<Vec<String>>,
    #[serde(default)]
    pub salient_objects: Option<Vec<String>>,
    /// Any readable text (labels, settings, numbers)
    #[serde(default)]
    pub readable_text: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct NextStepWire {
    #[serde(default)]
    pub title: Option<String>,
    /// One clear, actionable micro-instruction
    #[serde(default)]
    pub instruction: Option<String>,
    /// Checkable conditions, each naming an object and its expected state
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// What evidence photo to capture, e.g. "Show me the dial"
    #[serde(default)]
    pub verification_request: Option<String>,
    /// true when passing this step finishes the whole task
    #[serde(default)]
    pub completes_task: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct QuestionWire {
    #[serde(default)]
    pub text: Option<String>,
    /// free_text | yes_no | choice
    #[serde(default)]
    pub answer_shape: Option<String>,
    /// Options when answer_shape is choice
    #[serde(default)]
    pub options: Vec<String>,
}

/// Planner 原始输出格式：next_step / question / task_complete 至多一个
#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct CoachWire {
    #[serde(default)]
    pub next_step: Option<NextStepWire>,
    /// A single clarifying question
    #[serde(default)]
    pub question: Option<QuestionWire>,
    #[serde(default)]
    pub task_complete: Option<bool>,
    #[serde(default)]
    pub safety_warnings: Option<Vec<String>>,
    /// Short encouraging coaching message
    #[serde(default)]
    pub message: Option<String>,
}

/// 核验阶段原始输出格式
#[derive(Debug, Deserialize, JsonSchema)]
pub(crate) struct VerifierWire {
    /// pass | fail | unclear
    pub verdict: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Exactly one correction action (required when verdict is fail)
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub correction: Option<Value>,
    /// Which angle or lighting to capture (required when verdict is unclear)
    #[serde(default)]
    pub request_new_evidence: Option<String>,
}

/// 返回契约的 JSON Schema 字符串，可拼入 system prompt
pub fn contract_schema_json(contract: Contract) -> String {
    let schema = match contract {
        Contract::Perception => schema_for!(PerceptionWire),
        Contract::Coach => schema_for!(CoachWire),
        Contract::Verifier => schema_for!(VerifierWire),
    };
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
