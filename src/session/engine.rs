//! 会话状态机：所有会话变更的唯一入口
//!
//! 每个变更操作的流程：
//! 1. 取会话锁（tokio Mutex，FIFO），整个阶段调用期间持有
//! 2. 读取稳定快照，检查终态 / 超时
//! 3. 在工作副本上推进瞬时状态并调用阶段
//! 4. 全部成功才提交：追加观测、写审计记录、保存稳定状态
//!
//! 阶段失败时稳定快照只更新失败计数；同一步骤连续两次失败进入 Failed。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::core::{CoachError, StageFailure};
use crate::llm::LlmClient;
use crate::session::artifact::{ArtifactRecorder, SessionReport, VerificationArtifact};
use crate::session::model::{
    AnsweredQuestion, CoachUpdate, FrameSubmission, LifecycleState, Question, Session,
    SessionId, SessionSnapshot, StageFailureMark, Step, StepStatus,
};
use crate::session::observation::{Observation, ObservationStore, SequenceCheck};
use crate::stage::{
    CoachDecision, CoachOutput, FrameContext, PerceptionAdapter, PlannerAdapter,
    PlanningContext, RetryPolicy, Verdict, VerificationContext, VerifierAdapter,
};
use crate::store::{self, KvStore};

/// 同一逻辑步骤连续 StageFailure 达到该次数即进入 Failed
const MAX_CONSECUTIVE_STAGE_FAILURES: u32 = 2;

/// 引擎参数（来自 `[session]` 配置）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub rolling_window_size: usize,
    pub max_observations: usize,
    pub stage_timeout: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rolling_window_size: 5,
            max_observations: 200,
            stage_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// 三个阶段各自的 LLM 客户端（可以是同一个）
#[derive(Clone)]
pub struct StageClients {
    pub perception: Arc<dyn LlmClient>,
    pub planner: Arc<dyn LlmClient>,
    pub verifier: Arc<dyn LlmClient>,
}

impl StageClients {
    pub fn shared(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            perception: Arc::clone(&llm),
            planner: Arc::clone(&llm),
            verifier: llm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSession {
    pub goal: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStarted {
    pub session_id: SessionId,
    pub coach_update: CoachUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameOutcome {
    pub sequence: u64,
    /// 重复序号：未做任何处理，返回当前教练更新
    pub duplicate: bool,
    pub coach_update: CoachUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub verdict: Verdict,
    pub reason: String,
    pub correction: Option<String>,
    pub evidence_request: Option<String>,
    pub coach_update: CoachUpdate,
}

pub struct SessionEngine {
    kv: Arc<dyn KvStore>,
    observations: ObservationStore,
    artifacts: ArtifactRecorder,
    perception: PerceptionAdapter,
    planner: PlannerAdapter,
    verifier: VerifierAdapter,
    settings: EngineSettings,
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

fn transition(session: &mut Session, to: LifecycleState) {
    if session.state != to {
        debug!(session_id = %session.id, from = ?session.state, to = ?to, "Transition");
        session.state = to;
    }
}

fn require_non_empty(value: &str, field: &str) -> Result<(), CoachError> {
    if value.trim().is_empty() {
        return Err(CoachError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

impl SessionEngine {
    pub fn new(kv: Arc<dyn KvStore>, clients: StageClients, settings: EngineSettings) -> Self {
        let retry = RetryPolicy::new(settings.stage_timeout);
        Self {
            observations: ObservationStore::new(Arc::clone(&kv), settings.max_observations),
            artifacts: ArtifactRecorder::new(Arc::clone(&kv)),
            perception: PerceptionAdapter::new(clients.perception, retry.clone()),
            planner: PlannerAdapter::new(clients.planner, retry.clone()),
            verifier: VerifierAdapter::new(clients.verifier, retry),
            kv,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn observations(&self) -> &ObservationStore {
        &self.observations
    }

    pub fn artifacts(&self) -> &ArtifactRecorder {
        &self.artifacts
    }

    // ---------- 存取与锁 ----------

    async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let handle = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(session_id.to_string()).or_default())
        };
        handle.lock_owned().await
    }

    async fn load(&self, session_id: &str) -> Result<Session, CoachError> {
        store::load_json(self.kv.as_ref(), &store::session_key(session_id))
            .await?
            .ok_or_else(|| CoachError::NotFound(session_id.to_string()))
    }

    async fn save(&self, session: &Session) -> Result<(), CoachError> {
        debug_assert!(!session.state.is_transient(), "transient state persisted");
        store::save_json(self.kv.as_ref(), &store::session_key(&session.id), session).await?;
        Ok(())
    }

    /// 保存稳定状态；终态会话随即归档
    async fn commit(&self, session: &Session) -> Result<(), CoachError> {
        self.save(session).await?;
        if session.state.is_terminal() {
            self.archive(session).await;
        }
        Ok(())
    }

    /// 归档：释放观测分区与锁表项，快照与审计记录保留可读
    async fn archive(&self, session: &Session) {
        self.observations.release(&session.id).await;
        self.locks.lock().await.remove(&session.id);
        info!(session_id = %session.id, state = ?session.state, "Session archived");
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        match (now - session.last_mutation_at).to_std() {
            Ok(idle) => idle > self.settings.inactivity_timeout,
            Err(_) => false,
        }
    }

    async fn abandon(&self, mut session: Session, now: DateTime<Utc>) -> Result<Session, CoachError> {
        transition(&mut session, LifecycleState::Abandoned);
        if let Some(step) = session.active_step_mut() {
            if !step.status.is_resolved() {
                step.status = StepStatus::Pending;
            }
        }
        session.finished_at = Some(now);
        session.last_mutation_at = now;
        session.last_coach_update = session.coach_update(None);
        self.commit(&session).await?;
        info!(session_id = %session.id, "Session abandoned after inactivity");
        Ok(session)
    }

    /// 取锁并读取可变更的会话；终态拒绝，超时先放弃再拒绝
    async fn begin(
        &self,
        session_id: &str,
        operation: &'static str,
    ) -> Result<(OwnedMutexGuard<()>, Session), CoachError> {
        let guard = self.lock_session(session_id).await;
        let session = self.load(session_id).await?;
        if session.state.is_terminal() {
            return Err(CoachError::SessionClosed {
                session_id: session.id,
                state: session.state,
            });
        }
        let now = Utc::now();
        if self.is_expired(&session, now) {
            let abandoned = self.abandon(session, now).await?;
            return Err(CoachError::SessionClosed {
                session_id: abandoned.id,
                state: abandoned.state,
            });
        }
        debug!(session_id, operation, state = ?session.state, "Begin");
        Ok((guard, session))
    }

    /// 阶段失败：只在稳定快照上记账；同一步骤第二次失败进入 Failed
    async fn stage_failed(&self, mut session: Session, failure: StageFailure) -> CoachError {
        let step_key = session.active_step_id.clone();
        let count = match &session.stage_failures {
            Some(mark) if mark.step_key == step_key => mark.count + 1,
            _ => 1,
        };
        warn!(
            session_id = %session.id,
            step = ?step_key,
            count,
            error = %failure,
            "Stage failure"
        );
        session.stage_failures = Some(StageFailureMark {
            step_key,
            count,
            last_error: failure.to_string(),
        });

        if count < MAX_CONSECUTIVE_STAGE_FAILURES {
            return match self.save(&session).await {
                Ok(()) => CoachError::Stage(failure),
                Err(e) => e,
            };
        }

        let now = Utc::now();
        transition(&mut session, LifecycleState::Failed);
        if let Some(step) = session.active_step_mut() {
            step.status = StepStatus::Failed;
            step.resolved_at = Some(now);
        }
        session.pending_question = None;
        session.finished_at = Some(now);
        session.last_mutation_at = now;
        session.last_coach_update = session.coach_update(None);
        if let Err(e) = self.commit(&session).await {
            return e;
        }
        CoachError::SessionFailed {
            session_id: session.id,
            reason: failure.to_string(),
        }
    }

    // ---------- 操作 ----------

    /// 创建会话（不调用任何阶段）；相同幂等键返回同一会话
    pub async fn start_session(&self, req: StartSession) -> Result<SessionStarted, CoachError> {
        require_non_empty(&req.goal, "goal")?;
        let idem_key = req
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(store::idempotency_key);

        if let Some(key) = &idem_key {
            if let Some(existing) = self.existing_for_key(key).await? {
                return Ok(existing);
            }
        }

        let language = req
            .language
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "english".to_string());
        let now = Utc::now();
        let mut session = Session::new(req.goal.trim(), language, now);
        transition(&mut session, LifecycleState::AwaitingFrame);
        session.last_coach_update = session.coach_update(Some(format!(
            "Let's work on \"{}\" together. Point your camera at your setup so I can see where you are.",
            session.goal
        )));
        self.save(&session).await?;

        if let Some(key) = &idem_key {
            let claimed = self
                .kv
                .insert_new(key, store::encode(key, &session.id)?)
                .await?;
            if !claimed {
                // 并发创建输给了另一方：删除自己的快照，返回胜者
                self.kv.delete(&store::session_key(&session.id)).await?;
                if let Some(existing) = self.existing_for_key(key).await? {
                    return Ok(existing);
                }
                return Err(CoachError::Conflict(key.clone()));
            }
        }

        info!(session_id = %session.id, goal = %session.goal, "Session started");
        Ok(SessionStarted {
            session_id: session.id.clone(),
            coach_update: session.last_coach_update,
        })
    }

    async fn existing_for_key(&self, key: &str) -> Result<Option<SessionStarted>, CoachError> {
        let Some(session_id) = store::load_json::<String>(self.kv.as_ref(), key).await? else {
            return Ok(None);
        };
        let session = self.load(&session_id).await?;
        debug!(session_id = %session.id, "Idempotent start returned existing session");
        Ok(Some(SessionStarted {
            session_id: session.id,
            coach_update: session.last_coach_update,
        }))
    }

    /// 提交一帧：感知 ->（等待帧或证据时）规划 -> 提交
    pub async fn push_frame(
        &self,
        session_id: &str,
        frame: FrameSubmission,
    ) -> Result<FrameOutcome, CoachError> {
        require_non_empty(&frame.image_ref, "image_ref")?;
        let (_guard, session) = self.begin(session_id, "push_frame").await?;

        match self.observations.classify(session_id, frame.sequence).await? {
            SequenceCheck::Duplicate => {
                debug!(session_id, sequence = frame.sequence, "Duplicate frame ignored");
                return Ok(FrameOutcome {
                    sequence: frame.sequence,
                    duplicate: true,
                    coach_update: session.last_coach_update,
                });
            }
            SequenceCheck::OutOfOrder { last } => {
                return Err(CoachError::OutOfOrder {
                    sequence: frame.sequence,
                    last,
                });
            }
            SequenceCheck::Fresh => {}
        }

        let plan_now = match session.state {
            LifecycleState::AwaitingFrame | LifecycleState::AwaitingEvidence => true,
            LifecycleState::AwaitingAnswer | LifecycleState::AwaitingSafetyConfirmation => false,
            state => {
                return Err(CoachError::InvalidState {
                    state,
                    operation: "push_frame",
                })
            }
        };

        let now = Utc::now();
        let mut work = session.clone();
        transition(&mut work, LifecycleState::Perceiving);
        let window = self
            .observations
            .rolling_window(session_id, self.settings.rolling_window_size)
            .await?;

        let perceived = self
            .perception
            .perceive(FrameContext {
                goal: &work.goal,
                step_focus: work.active_step().map(|s| s.title.as_str()),
                frame: &frame,
                recent: &window,
            })
            .await;
        let perception = match perceived {
            Ok(p) => p,
            Err(failure) => return Err(self.stage_failed(session, failure).await),
        };
        let observation = Observation::from_perception(&frame, perception, now);

        let decision = if plan_now {
            transition(&mut work, LifecycleState::Planning);
            let planned = self
                .planner
                .plan(PlanningContext {
                    goal: &work.goal,
                    language: &work.language,
                    window: &window,
                    incoming: Some(&observation),
                    active_step: work.active_step(),
                    completed_steps: work.completed_steps(),
                    total_steps: work.steps.len(),
                    answers: &work.answers,
                    pending_answer: None,
                })
                .await;
            match planned {
                Ok(output) => Some(output),
                Err(failure) => return Err(self.stage_failed(session, failure).await),
            }
        } else {
            None
        };

        self.observations.append(session_id, observation).await?;
        work.last_observation_at = Some(now);
        work.stage_failures = None;
        match decision {
            Some(output) => self.apply_coach(&mut work, output, now),
            None => {
                // 问题或安全确认未处理：只记录观测，保留原有更新文案
                transition(&mut work, session.state);
                work.last_coach_update = work.coach_update(Some(session.last_coach_update.message));
            }
        }
        work.last_mutation_at = now;
        self.commit(&work).await?;

        info!(session_id, sequence = frame.sequence, state = ?work.state, "Frame accepted");
        Ok(FrameOutcome {
            sequence: frame.sequence,
            duplicate: false,
            coach_update: work.last_coach_update,
        })
    }

    /// 应用 Planner 决策；安全警告在其余决策记录之后强制进入确认等待
    fn apply_coach(&self, work: &mut Session, output: CoachOutput, now: DateTime<Utc>) {
        let CoachOutput {
            decision,
            safety_warnings,
            message,
        } = output;
        let mut message = message;
        let mut completed = false;

        match decision {
            CoachDecision::NextStep(plan) => {
                if work.active_step().is_none() {
                    let step = Step::from_plan(work.steps.len(), plan, now);
                    info!(session_id = %work.id, step_id = %step.id, title = %step.title, "New step");
                    message.get_or_insert_with(|| step.instruction.clone());
                    work.active_step_id = Some(step.id.clone());
                    work.steps.push(step);
                } else {
                    // 活动步骤未完成：新步骤只作为建议文案
                    message.get_or_insert(plan.instruction);
                }
            }
            CoachDecision::Question(plan) => {
                let question = Question::from_plan(plan);
                message.get_or_insert_with(|| question.text.clone());
                work.pending_question = Some(question);
            }
            CoachDecision::TaskComplete => {
                if work.active_step().is_none() {
                    completed = true;
                } else {
                    debug!(session_id = %work.id, "task_complete ignored while a step is active");
                }
            }
            CoachDecision::SafetyOnly => {}
        }

        work.safety_warnings = safety_warnings;
        if completed {
            transition(work, LifecycleState::Completed);
            work.finished_at = Some(now);
            work.safety_hold = false;
        } else if !work.safety_warnings.is_empty() {
            work.safety_hold = true;
            transition(work, LifecycleState::AwaitingSafetyConfirmation);
        } else {
            work.safety_hold = false;
            let resting = work.resting_state();
            transition(work, resting);
        }
        work.last_coach_update = work.coach_update(message);
    }

    /// 回答待定问题；Planner 失败时问题保持待定
    pub async fn answer_question(
        &self,
        session_id: &str,
        question_id: &str,
        answer: &str,
    ) -> Result<CoachUpdate, CoachError> {
        require_non_empty(question_id, "question_id")?;
        require_non_empty(answer, "answer")?;
        let (_guard, session) = self.begin(session_id, "answer_question").await?;

        let question = match &session.pending_question {
            Some(q) if q.id == question_id => q.clone(),
            _ => {
                return Err(CoachError::StaleReference(format!(
                    "question {question_id} is not pending"
                )))
            }
        };
        if session.state != LifecycleState::AwaitingAnswer {
            return Err(CoachError::InvalidState {
                state: session.state,
                operation: "answer_question",
            });
        }

        let now = Utc::now();
        let answer = answer.trim();
        let mut work = session.clone();
        transition(&mut work, LifecycleState::Planning);
        let window = self
            .observations
            .rolling_window(session_id, self.settings.rolling_window_size)
            .await?;

        let planned = self
            .planner
            .plan(PlanningContext {
                goal: &work.goal,
                language: &work.language,
                window: &window,
                incoming: None,
                active_step: work.active_step(),
                completed_steps: work.completed_steps(),
                total_steps: work.steps.len(),
                answers: &work.answers,
                pending_answer: Some((&question, answer)),
            })
            .await;
        let output = match planned {
            Ok(output) => output,
            Err(failure) => return Err(self.stage_failed(session, failure).await),
        };

        work.pending_question = None;
        work.push_answer(
            AnsweredQuestion {
                question_id: question.id,
                question: question.text,
                answer: answer.to_string(),
                answered_at: now,
            },
            self.settings.rolling_window_size,
        );
        work.stage_failures = None;
        self.apply_coach(&mut work, output, now);
        work.last_mutation_at = now;
        self.commit(&work).await?;

        info!(session_id, state = ?work.state, "Question answered");
        Ok(work.last_coach_update)
    }

    /// 核验活动步骤
    pub async fn verify_step(
        &self,
        session_id: &str,
        step_id: &str,
        evidence_ref: &str,
    ) -> Result<VerifyOutcome, CoachError> {
        require_non_empty(step_id, "step_id")?;
        require_non_empty(evidence_ref, "evidence_ref")?;
        let (_guard, session) = self.begin(session_id, "verify_step").await?;

        let Some(active) = session.active_step().filter(|s| s.id == step_id) else {
            return Err(CoachError::StaleReference(format!(
                "step {step_id} is not the active step"
            )));
        };
        if session.state != LifecycleState::AwaitingEvidence {
            return Err(CoachError::InvalidState {
                state: session.state,
                operation: "verify_step",
            });
        }
        if active.judged_evidence.iter().any(|e| e == evidence_ref) {
            return Err(CoachError::Validation(format!(
                "evidence {evidence_ref} was already judged for {step_id}; capture new evidence"
            )));
        }

        // 审计日志决定编号：快照提交失败后重试不会撞上已写入的键
        let attempt = self.artifacts.next_attempt(session_id, step_id).await?;
        let now = Utc::now();
        let mut work = session.clone();
        transition(&mut work, LifecycleState::Verifying);
        let latest = self.observations.latest(session_id).await?;

        let verified = match work.active_step() {
            Some(step) => {
                self.verifier
                    .verify(VerificationContext {
                        step,
                        evidence_ref,
                        latest: latest.as_deref(),
                    })
                    .await
            }
            None => {
                return Err(CoachError::StaleReference(format!(
                    "step {step_id} is not the active step"
                )))
            }
        };
        let output = match verified {
            Ok(output) => output,
            Err(failure) => return Err(self.stage_failed(session, failure).await),
        };

        let Some(step) = work.active_step_mut() else {
            return Err(CoachError::StaleReference(step_id.to_string()));
        };
        step.verification_count = attempt;
        step.judged_evidence.push(evidence_ref.to_string());
        let artifact = VerificationArtifact {
            session_id: session_id.to_string(),
            step_id: step.id.clone(),
            attempt,
            evidence_ref: evidence_ref.to_string(),
            verdict: output.verdict,
            reason: output.reason.clone(),
            correction: output.correction.clone(),
            evidence_request: output.evidence_request.clone(),
            observation_sequence: latest.as_ref().map(|o| o.sequence),
            scene_summary: latest.as_ref().map(|o| o.scene_summary.clone()),
            state_estimate: latest
                .as_ref()
                .map(|o| o.state_estimate.clone())
                .unwrap_or_default(),
            state_delta: latest
                .as_ref()
                .map(|o| o.state_delta.clone())
                .unwrap_or_default(),
            recorded_at: now,
        };
        self.artifacts.record(&artifact).await?;

        let message = match output.verdict {
            Verdict::Pass => {
                let title = step.title.clone();
                let completes_task = step.completes_task;
                step.status = StepStatus::Verified;
                step.resolved_at = Some(now);
                step.evidence_request = None;
                transition(&mut work, LifecycleState::Advancing);
                work.active_step_id = None;
                if completes_task {
                    work.finished_at = Some(now);
                    transition(&mut work, LifecycleState::Completed);
                } else {
                    transition(&mut work, LifecycleState::AwaitingFrame);
                }
                format!("Nice work, \"{title}\" is done. {}", output.reason)
            }
            Verdict::Fail => {
                let correction = output.correction.clone().unwrap_or_default();
                step.attempt_count += 1;
                step.corrections.push(correction.clone());
                step.evidence_request = None;
                transition(&mut work, LifecycleState::Correcting);
                transition(&mut work, LifecycleState::AwaitingEvidence);
                correction
            }
            Verdict::Unclear => {
                let request = output.evidence_request.clone().unwrap_or_default();
                step.evidence_request = Some(request.clone());
                transition(&mut work, LifecycleState::AwaitingEvidence);
                request
            }
        };

        work.stage_failures = None;
        work.last_mutation_at = now;
        work.last_coach_update = work.coach_update(Some(message));
        self.commit(&work).await?;

        info!(session_id, step_id, verdict = %output.verdict, state = ?work.state, "Step verification applied");
        Ok(VerifyOutcome {
            verdict: output.verdict,
            reason: output.reason,
            correction: output.correction,
            evidence_request: output.evidence_request,
            coach_update: work.last_coach_update,
        })
    }

    /// 确认安全警告，回到挂起前的等待状态
    pub async fn confirm_safety(&self, session_id: &str) -> Result<CoachUpdate, CoachError> {
        let (_guard, session) = self.begin(session_id, "confirm_safety").await?;
        if session.state != LifecycleState::AwaitingSafetyConfirmation {
            return Err(CoachError::InvalidState {
                state: session.state,
                operation: "confirm_safety",
            });
        }

        let mut work = session;
        work.safety_hold = false;
        work.safety_warnings.clear();
        let resting = work.resting_state();
        transition(&mut work, resting);
        work.last_mutation_at = Utc::now();
        work.last_coach_update = work.coach_update(None);
        self.commit(&work).await?;

        info!(session_id, state = ?work.state, "Safety warning confirmed");
        Ok(work.last_coach_update)
    }

    /// 跳过活动步骤
    pub async fn skip_step(&self, session_id: &str, step_id: &str) -> Result<CoachUpdate, CoachError> {
        require_non_empty(step_id, "step_id")?;
        let (_guard, mut work) = self.begin(session_id, "skip_step").await?;
        if work.active_step().map(|s| s.id.as_str()) != Some(step_id) {
            return Err(CoachError::StaleReference(format!(
                "step {step_id} is not the active step"
            )));
        }
        if work.state != LifecycleState::AwaitingEvidence {
            return Err(CoachError::InvalidState {
                state: work.state,
                operation: "skip_step",
            });
        }

        let now = Utc::now();
        if let Some(step) = work.active_step_mut() {
            step.status = StepStatus::Skipped;
            step.resolved_at = Some(now);
        }
        work.active_step_id = None;
        let resting = work.resting_state();
        transition(&mut work, resting);
        work.last_mutation_at = now;
        work.last_coach_update = work.coach_update(Some(
            "Step skipped. Show me your setup and we'll pick the next one.".to_string(),
        ));
        self.commit(&work).await?;

        info!(session_id, step_id, "Step skipped");
        Ok(work.last_coach_update)
    }

    /// 恢复：只读快照，不取锁、不调用阶段、不修改任何状态
    pub async fn resume_session(&self, session_id: &str) -> Result<SessionSnapshot, CoachError> {
        let session = self.load(session_id).await?;
        let rolling_window = self
            .observations
            .snapshot_window(session_id, self.settings.rolling_window_size)
            .await?;
        Ok(SessionSnapshot {
            coach_update: session.last_coach_update.clone(),
            session,
            rolling_window,
        })
    }

    pub async fn report(&self, session_id: &str) -> Result<SessionReport, CoachError> {
        let session = self.load(session_id).await?;
        self.artifacts.report(&session).await
    }

    /// 放弃所有超时的非终态会话；逐个在会话锁下复查，返回被放弃的会话 ID
    pub async fn abandon_inactive(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, CoachError> {
        let rows = self.kv.scan_prefix("session/").await?;
        let mut candidates = Vec::new();
        for (key, bytes) in rows {
            let session: Session = store::decode(&key, &bytes)?;
            if !session.state.is_terminal() && self.is_expired(&session, now) {
                candidates.push(session.id);
            }
        }

        let mut abandoned = Vec::new();
        for session_id in candidates {
            let _guard = self.lock_session(&session_id).await;
            let session = self.load(&session_id).await?;
            // 等锁期间可能已有成功的转换
            if session.state.is_terminal() || !self.is_expired(&session, now) {
                continue;
            }
            self.abandon(session, now).await?;
            abandoned.push(session_id);
        }
        Ok(abandoned)
    }
}
