//! 核验审计记录与会话报告
//!
//! 每次核验调用写一条 VerificationArtifact，键为 `artifact/{session}/{step}/{attempt}`，只增不改。
//! 报告只由审计记录与会话元数据生成。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::core::{CoachError, StoreError};
use crate::session::{LifecycleState, Session, StepStatus};
use crate::stage::Verdict;
use crate::store::{self, KvStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationArtifact {
    pub session_id: String,
    pub step_id: String,
    /// 该步骤的第几次核验调用（从 1 开始）
    pub attempt: u32,
    pub evidence_ref: String,
    pub verdict: Verdict,
    pub reason: String,
    pub correction: Option<String>,
    pub evidence_request: Option<String>,
    /// 核验时最新观测的副本：观测被淘汰后审计记录仍自包含
    pub observation_sequence: Option<u64>,
    #[serde(default)]
    pub scene_summary: Option<String>,
    #[serde(default)]
    pub state_estimate: Map<String, Value>,
    pub state_delta: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

/// 单步核验历史中的一条
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictEntry {
    pub attempt: u32,
    pub evidence_ref: String,
    pub verdict: Verdict,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub title: String,
    pub status: StepStatus,
    pub verdicts: Vec<VerdictEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEntry {
    pub step_id: String,
    pub attempt: u32,
    pub correction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub title: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub goal: String,
    pub language: String,
    pub state: LifecycleState,
    pub steps: Vec<StepReport>,
    pub checklist: Vec<ChecklistItem>,
    pub steps_verified: usize,
    pub total_verifications: usize,
    pub total_corrections: usize,
    pub unclear_count: usize,
    pub corrections_log: Vec<CorrectionEntry>,
    pub elapsed_secs: i64,
}

pub struct ArtifactRecorder {
    kv: Arc<dyn KvStore>,
}

impl ArtifactRecorder {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// 仅当键不存在时写入；已存在则返回 Conflict，原记录保留
    pub async fn record(&self, artifact: &VerificationArtifact) -> Result<(), CoachError> {
        let has_correction = artifact.correction.is_some();
        if has_correction != (artifact.verdict == Verdict::Fail) {
            return Err(CoachError::Validation(format!(
                "artifact for {} attempt {} must carry a correction iff the verdict is fail",
                artifact.step_id, artifact.attempt
            )));
        }

        let key = store::artifact_key(&artifact.session_id, &artifact.step_id, artifact.attempt);
        let inserted = self.kv.insert_new(&key, store::encode(&key, artifact)?).await?;
        if !inserted {
            return Err(CoachError::Conflict(key));
        }
        info!(
            session_id = %artifact.session_id,
            step_id = %artifact.step_id,
            attempt = artifact.attempt,
            verdict = %artifact.verdict,
            "Recorded verification artifact"
        );
        Ok(())
    }

    /// 该步骤下一次核验的 attempt：已记录的最大值加一。以审计日志为准，
    /// 快照未能提交时也不会复用已写入的键
    pub async fn next_attempt(&self, session_id: &str, step_id: &str) -> Result<u32, CoachError> {
        let rows = self
            .kv
            .scan_prefix(&store::artifact_step_prefix(session_id, step_id))
            .await?;
        let mut max = 0;
        for (key, _) in rows {
            let attempt = key
                .rsplit('/')
                .next()
                .and_then(|suffix| suffix.parse::<u32>().ok())
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.clone(),
                    reason: "artifact key has no attempt suffix".to_string(),
                })?;
            max = max.max(attempt);
        }
        Ok(max + 1)
    }

    /// 会话的全部审计记录，按键序（步骤、attempt）
    pub async fn artifacts(&self, session_id: &str) -> Result<Vec<VerificationArtifact>, CoachError> {
        let rows = self.kv.scan_prefix(&store::artifact_prefix(session_id)).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, bytes) in rows {
            out.push(store::decode(&key, &bytes)?);
        }
        Ok(out)
    }

    pub async fn report(&self, session: &Session) -> Result<SessionReport, CoachError> {
        let artifacts = self.artifacts(&session.id).await?;
        Ok(build_report(session, &artifacts, Utc::now()))
    }
}

fn build_report(
    session: &Session,
    artifacts: &[VerificationArtifact],
    now: DateTime<Utc>,
) -> SessionReport {
    let steps: Vec<StepReport> = session
        .steps
        .iter()
        .map(|step| StepReport {
            step_id: step.id.clone(),
            title: step.title.clone(),
            status: step.status,
            verdicts: artifacts
                .iter()
                .filter(|a| a.step_id == step.id)
                .map(|a| VerdictEntry {
                    attempt: a.attempt,
                    evidence_ref: a.evidence_ref.clone(),
                    verdict: a.verdict,
                    reason: a.reason.clone(),
                })
                .collect(),
        })
        .collect();

    let corrections_log: Vec<CorrectionEntry> = artifacts
        .iter()
        .filter_map(|a| {
            a.correction.as_ref().map(|c| CorrectionEntry {
                step_id: a.step_id.clone(),
                attempt: a.attempt,
                correction: c.clone(),
            })
        })
        .collect();

    let end = session.finished_at.unwrap_or(now);

    SessionReport {
        session_id: session.id.clone(),
        goal: session.goal.clone(),
        language: session.language.clone(),
        state: session.state,
        checklist: session
            .steps
            .iter()
            .map(|s| ChecklistItem {
                title: s.title.clone(),
                status: s.status,
            })
            .collect(),
        steps_verified: session.completed_steps(),
        total_verifications: artifacts.len(),
        total_corrections: corrections_log.len(),
        unclear_count: artifacts
            .iter()
            .filter(|a| a.verdict == Verdict::Unclear)
            .count(),
        corrections_log,
        steps,
        elapsed_secs: (end - session.created_at).num_seconds().max(0),
    }
}
