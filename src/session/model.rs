//! 会话数据模型：生命周期状态、步骤、问题、教练更新与快照
//!
//! Session 只由 SessionEngine 的状态转换函数修改；这里只提供纯数据与投影。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Observation;
use crate::stage::{AnswerShape, QuestionPlan, StepPlan, SuccessCriterion};

/// 会话 ID
pub type SessionId = String;

/// 会话生命周期状态
///
/// 瞬时状态（Perceiving / Planning / Verifying / Advancing / Correcting）只存在于持锁的工作副本上，
/// 持久化的永远是稳定状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    AwaitingFrame,
    Perceiving,
    Planning,
    AwaitingAnswer,
    AwaitingEvidence,
    /// Planner 给出安全警告，需用户显式确认后才继续
    AwaitingSafetyConfirmation,
    Verifying,
    Advancing,
    Correcting,
    Completed,
    Abandoned,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Abandoned | LifecycleState::Failed
        )
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            LifecycleState::Perceiving
                | LifecycleState::Planning
                | LifecycleState::Verifying
                | LifecycleState::Advancing
                | LifecycleState::Correcting
        )
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    AwaitingEvidence,
    Verified,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            StepStatus::Verified | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 一个可核验的任务步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub instruction: String,
    pub success_criteria: Vec<SuccessCriterion>,
    pub verification_request: Option<String>,
    pub status: StepStatus,
    /// fail 结论次数（unclear 不计）
    pub attempt_count: u32,
    /// 核验调用次数（含 unclear），也是审计记录的 attempt 序号
    pub verification_count: u32,
    /// 已判定过的证据引用；同一证据不会被再次判定
    pub judged_evidence: Vec<String>,
    pub corrections: Vec<String>,
    /// 最近一次 unclear 时的新证据要求
    pub evidence_request: Option<String>,
    pub completes_task: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_plan(index: usize, plan: StepPlan, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("step_{:03}", index + 1),
            title: plan.title,
            instruction: plan.instruction,
            success_criteria: plan.success_criteria,
            verification_request: plan.verification_request,
            status: StepStatus::AwaitingEvidence,
            attempt_count: 0,
            verification_count: 0,
            judged_evidence: Vec::new(),
            corrections: Vec::new(),
            evidence_request: None,
            completes_task: plan.completes_task,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn last_correction(&self) -> Option<&str> {
        self.corrections.last().map(String::as_str)
    }
}

/// 待回答的问题（每个会话至多一个）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    pub expected: AnswerShape,
}

impl Question {
    pub fn from_plan(plan: QuestionPlan) -> Self {
        Self {
            id: format!("q_{}", uuid::Uuid::new_v4()),
            text: plan.text,
            expected: plan.shape,
        }
    }
}

/// 已回答的问题，作为后续规划上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub question_id: String,
    pub question: String,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

/// 连续 StageFailure 记账：step_key 为当时的活动步骤（None 表示尚无步骤）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailureMark {
    pub step_key: Option<String>,
    pub count: u32,
    pub last_error: String,
}

/// 客户端一次提交的相机帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSubmission {
    pub sequence: u64,
    pub image_ref: String,
    #[serde(default)]
    pub transcript: Option<String>,
}

/// 返回给客户端的状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoachStatus {
    NeedsInput,
    InProgress,
    VerifyStep,
    SafetyHold,
    Complete,
    Failed,
    Abandoned,
}

/// 步骤的客户端视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub step_id: String,
    pub title: String,
    pub instruction: String,
    pub success_criteria: Vec<SuccessCriterion>,
    pub attempt_count: u32,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            title: step.title.clone(),
            instruction: step.instruction.clone(),
            success_criteria: step.success_criteria.clone(),
            attempt_count: step.attempt_count,
        }
    }
}

/// 教练更新：每次成功的转换后返回给客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoachUpdate {
    pub status: CoachStatus,
    pub message: String,
    pub active_step: Option<StepView>,
    pub question: Option<Question>,
    pub safety_warnings: Vec<String>,
    pub verification_request: Option<String>,
    pub correction: Option<String>,
}

/// 一次教练会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub goal: String,
    pub language: String,
    pub state: LifecycleState,
    pub steps: Vec<Step>,
    pub active_step_id: Option<String>,
    pub pending_question: Option<Question>,
    pub safety_hold: bool,
    pub safety_warnings: Vec<String>,
    /// 最近的回答（长度不超过滚动窗口）
    pub answers: Vec<AnsweredQuestion>,
    pub stage_failures: Option<StageFailureMark>,
    pub last_coach_update: CoachUpdate,
    pub created_at: DateTime<Utc>,
    pub last_observation_at: Option<DateTime<Utc>>,
    pub last_mutation_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(goal: impl Into<String>, language: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut session = Self {
            id: format!("session_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            language: language.into(),
            state: LifecycleState::Created,
            steps: Vec::new(),
            active_step_id: None,
            pending_question: None,
            safety_hold: false,
            safety_warnings: Vec::new(),
            answers: Vec::new(),
            stage_failures: None,
            last_coach_update: CoachUpdate {
                status: CoachStatus::NeedsInput,
                message: String::new(),
                active_step: None,
                question: None,
                safety_warnings: Vec::new(),
                verification_request: None,
                correction: None,
            },
            created_at: now,
            last_observation_at: None,
            last_mutation_at: now,
            finished_at: None,
        };
        session.last_coach_update = session.coach_update(None);
        session
    }

    pub fn active_step(&self) -> Option<&Step> {
        let id = self.active_step_id.as_deref()?;
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn active_step_mut(&mut self) -> Option<&mut Step> {
        let id = self.active_step_id.clone()?;
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Verified)
            .count()
    }

    /// 没有安全挂起时应处的等待状态
    pub fn resting_state(&self) -> LifecycleState {
        if self.pending_question.is_some() {
            LifecycleState::AwaitingAnswer
        } else if self.active_step().is_some() {
            LifecycleState::AwaitingEvidence
        } else {
            LifecycleState::AwaitingFrame
        }
    }

    pub fn push_answer(&mut self, answer: AnsweredQuestion, keep: usize) {
        self.answers.push(answer);
        if self.answers.len() > keep {
            let excess = self.answers.len() - keep;
            self.answers.drain(..excess);
        }
    }

    /// 从当前状态投影出教练更新；message 为空时使用按状态的默认文案
    pub fn coach_update(&self, message: Option<String>) -> CoachUpdate {
        let active = self.active_step();
        let status = match self.state {
            LifecycleState::Created | LifecycleState::AwaitingFrame => CoachStatus::NeedsInput,
            LifecycleState::AwaitingAnswer => CoachStatus::NeedsInput,
            LifecycleState::AwaitingEvidence => CoachStatus::VerifyStep,
            LifecycleState::AwaitingSafetyConfirmation => CoachStatus::SafetyHold,
            LifecycleState::Completed => CoachStatus::Complete,
            LifecycleState::Failed => CoachStatus::Failed,
            LifecycleState::Abandoned => CoachStatus::Abandoned,
            _ => CoachStatus::InProgress,
        };
        let message = message.unwrap_or_else(|| {
            match status {
                CoachStatus::NeedsInput => match &self.pending_question {
                    Some(q) => q.text.clone(),
                    None => "Point your camera at your setup so I can see where you are.".into(),
                },
                CoachStatus::VerifyStep => active
                    .map(|s| s.instruction.clone())
                    .unwrap_or_else(|| "Show me your progress.".into()),
                CoachStatus::SafetyHold => {
                    "Stop for a moment and confirm you have read the safety warning.".into()
                }
                CoachStatus::Complete => "All done. Nice work!".into(),
                CoachStatus::Failed => {
                    "I could not continue this step. Your progress so far is saved.".into()
                }
                CoachStatus::Abandoned => "This session was closed after inactivity.".into(),
                CoachStatus::InProgress => "Working on it.".into(),
            }
        });

        CoachUpdate {
            status,
            message,
            active_step: active.map(StepView::from),
            question: self.pending_question.clone(),
            safety_warnings: self.safety_warnings.clone(),
            verification_request: active.and_then(|s| {
                s.evidence_request
                    .clone()
                    .or_else(|| s.verification_request.clone())
            }),
            correction: active.and_then(|s| s.last_correction().map(String::from)),
        }
    }
}

/// resume 返回的会话快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub rolling_window: Vec<Observation>,
    pub coach_update: CoachUpdate,
}
