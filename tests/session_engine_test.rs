//! 会话引擎集成测试：脚本化 LLM + 内存 / SQLite 存储

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use realitycheck::core::{CoachError, StoreError};
    use realitycheck::llm::{LlmClient, MockLlmClient, ScriptedLlmClient, ScriptedReply};
    use realitycheck::session::{
        CoachStatus, EngineSettings, FrameSubmission, LifecycleState, SessionEngine,
        StageClients, StartSession, StepStatus,
    };
    use realitycheck::stage::Verdict;
    use realitycheck::store::{KvStore, MemoryKvStore, SqliteKvStore};

    const DIAL_UNSET: &str = r#"{"scene_summary": "washing machine, dial unset",
        "state_estimate": {"dial": "unset"}, "state_delta": {}}"#;

    const SET_DIAL: &str = r#"{"next_step": {"title": "Set dial",
        "instruction": "set dial to delicate cycle",
        "success_criteria": [{"subject": "dial", "expected": "delicate"}],
        "verification_request": "Show me the dial"}}"#;

    const PASS: &str = r#"{"verdict": "pass", "reason": "Dial points at Delicate"}"#;

    fn engine(llm: Arc<dyn LlmClient>, kv: Arc<dyn KvStore>) -> SessionEngine {
        SessionEngine::new(
            kv,
            StageClients::shared(llm),
            EngineSettings {
                stage_timeout: Duration::from_secs(2),
                ..EngineSettings::default()
            },
        )
    }

    fn engine_with_capacity(
        llm: Arc<dyn LlmClient>,
        kv: Arc<dyn KvStore>,
        max_observations: usize,
    ) -> SessionEngine {
        SessionEngine::new(
            kv,
            StageClients::shared(llm),
            EngineSettings {
                stage_timeout: Duration::from_secs(2),
                max_observations,
                ..EngineSettings::default()
            },
        )
    }

    /// 下一次写会话快照时失败一次
    #[derive(Default)]
    struct FlakySnapshotStore {
        inner: MemoryKvStore,
        fail_next_snapshot: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakySnapshotStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            if key.starts_with("session/") && self.fail_next_snapshot.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Backend("disk hiccup".into()));
            }
            self.inner.put(key, value).await
        }

        async fn insert_new(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
            self.inner.insert_new(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.scan_prefix(prefix).await
        }
    }

    fn scripted(replies: &[&str]) -> Arc<ScriptedLlmClient> {
        Arc::new(ScriptedLlmClient::new(
            replies.iter().map(|r| ScriptedReply::text(*r)),
        ))
    }

    fn start(goal: &str) -> StartSession {
        StartSession {
            goal: goal.to_string(),
            language: Some("english".to_string()),
            idempotency_key: None,
        }
    }

    fn frame(sequence: u64) -> FrameSubmission {
        FrameSubmission {
            sequence,
            image_ref: format!("frame-{sequence:03}.jpg"),
            transcript: None,
        }
    }

    #[tokio::test]
    async fn test_delicates_washing_scenario() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL, PASS]);
        let engine = engine(llm.clone(), Arc::new(MemoryKvStore::new()));

        let started = engine
            .start_session(start("Wash clothes - delicates"))
            .await
            .unwrap();
        assert_eq!(started.coach_update.status, CoachStatus::NeedsInput);
        assert_eq!(llm.calls(), 0);
        let sid = started.session_id;

        let out = engine.push_frame(&sid, frame(1)).await.unwrap();
        assert_eq!(out.coach_update.status, CoachStatus::VerifyStep);
        let step = out.coach_update.active_step.unwrap();
        assert_eq!(step.instruction, "set dial to delicate cycle");
        assert_eq!(
            out.coach_update.verification_request.as_deref(),
            Some("Show me the dial")
        );

        let verdict = engine
            .verify_step(&sid, &step.step_id, "evidence-dial-delicate.jpg")
            .await
            .unwrap();
        assert_eq!(verdict.verdict, Verdict::Pass);
        assert!(verdict.coach_update.active_step.is_none());

        let report = engine.report(&sid).await.unwrap();
        assert_eq!(report.steps_verified, 1);
        assert_eq!(report.total_corrections, 0);
        assert_eq!(report.total_verifications, 1);
        assert_eq!(report.checklist[0].status, StepStatus::Verified);
        assert_eq!(report.state, LifecycleState::AwaitingFrame);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_blurry_evidence_requires_new_evidence() {
        let llm = scripted(&[
            DIAL_UNSET,
            SET_DIAL,
            r#"{"verdict": "unclear", "reason": "Too dark to read the dial",
                "request_new_evidence": "Turn on the light and shoot the dial head-on"}"#,
            PASS,
        ]);
        let engine = engine(llm.clone(), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes - delicates")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let unclear = engine.verify_step(&sid, "step_001", "evidence-blurry.jpg").await.unwrap();
        assert_eq!(unclear.verdict, Verdict::Unclear);
        assert_eq!(
            unclear.coach_update.verification_request.as_deref(),
            Some("Turn on the light and shoot the dial head-on")
        );
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.steps[0].attempt_count, 0);
        assert_eq!(session.steps[0].status, StepStatus::AwaitingEvidence);

        // 同一证据不会被再次判定
        let err = engine
            .verify_step(&sid, "step_001", "evidence-blurry.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, CoachError::Validation(_)));
        assert_eq!(llm.calls(), 3);

        let pass = engine.verify_step(&sid, "step_001", "evidence-clear.jpg").await.unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
        let report = engine.report(&sid).await.unwrap();
        assert_eq!(report.unclear_count, 1);
        assert_eq!(report.steps[0].verdicts.len(), 2);
    }

    #[tokio::test]
    async fn test_fail_verdict_surfaces_correction() {
        let llm = scripted(&[
            DIAL_UNSET,
            SET_DIAL,
            r#"{"verdict": "fail", "reason": "Dial on Cotton", "correction": "Turn the dial two clicks left to Delicate"}"#,
            PASS,
        ]);
        let engine = engine(llm, Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes - delicates")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let fail = engine.verify_step(&sid, "step_001", "ev-1.jpg").await.unwrap();
        assert_eq!(fail.verdict, Verdict::Fail);
        assert_eq!(
            fail.coach_update.correction.as_deref(),
            Some("Turn the dial two clicks left to Delicate")
        );
        assert_eq!(fail.coach_update.active_step.unwrap().attempt_count, 1);

        engine.verify_step(&sid, "step_001", "ev-2.jpg").await.unwrap();
        let report = engine.report(&sid).await.unwrap();
        assert_eq!(report.total_corrections, 1);
        assert_eq!(report.corrections_log[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_rolling_window_tracks_last_n() {
        let engine = engine(Arc::new(MockLlmClient), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Tidy desk")).await.unwrap().session_id;

        for seq in 1..=8 {
            engine.push_frame(&sid, frame(seq)).await.unwrap();
            let window = engine.resume_session(&sid).await.unwrap().rolling_window;
            let expected: Vec<u64> = (seq.saturating_sub(4).max(1)..=seq).collect();
            let got: Vec<u64> = window.iter().map(|o| o.sequence).collect();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn test_duplicate_frame_is_bit_identical_noop() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL]);
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine(llm.clone(), kv.clone());
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        let first = engine.push_frame(&sid, frame(1)).await.unwrap();
        let before = engine.resume_session(&sid).await.unwrap();
        let entries = kv.len().await;

        let mut again = frame(1);
        again.image_ref = "other.jpg".into();
        let dup = engine.push_frame(&sid, again).await.unwrap();
        assert!(dup.duplicate);
        assert_eq!(dup.coach_update, first.coach_update);

        let after = engine.resume_session(&sid).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(kv.len().await, entries);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_frame_rejected() {
        let engine = engine(Arc::new(MockLlmClient), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Tidy desk")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(3)).await.unwrap();
        let err = engine.push_frame(&sid, frame(2)).await.unwrap_err();
        assert!(matches!(err, CoachError::OutOfOrder { sequence: 2, last: 3 }));
    }

    #[tokio::test]
    async fn test_resume_has_no_side_effects() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL]);
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine(llm.clone(), kv.clone());
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let entries = kv.len().await;
        let a = engine.resume_session(&sid).await.unwrap();
        let b = engine.resume_session(&sid).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(kv.len().await, entries);
        assert_eq!(llm.calls(), 2);
        assert!(engine.artifacts().artifacts(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_step_id_rejected_without_change() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL]);
        let engine = engine(llm.clone(), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();
        let before = engine.resume_session(&sid).await.unwrap();

        let err = engine.verify_step(&sid, "step_999", "ev.jpg").await.unwrap_err();
        assert!(matches!(err, CoachError::StaleReference(_)));
        let err = engine.verify_step(&sid, "step_001", "  ").await.unwrap_err();
        assert!(matches!(err, CoachError::Validation(_)));

        assert_eq!(engine.resume_session(&sid).await.unwrap(), before);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_two_stage_failures_on_step_fail_session() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL, "garbage", "garbage", "garbage", "garbage", PASS]);
        let engine = engine(llm.clone(), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let first = engine.verify_step(&sid, "step_001", "ev-1.jpg").await.unwrap_err();
        assert!(first.is_retriable());
        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::AwaitingEvidence);

        let second = engine.verify_step(&sid, "step_001", "ev-1.jpg").await.unwrap_err();
        assert!(matches!(second, CoachError::SessionFailed { .. }));
        assert_eq!(llm.calls(), 6);

        let closed = engine.verify_step(&sid, "step_001", "ev-2.jpg").await.unwrap_err();
        assert!(matches!(
            closed,
            CoachError::SessionClosed {
                state: LifecycleState::Failed,
                ..
            }
        ));
        assert_eq!(llm.calls(), 6);

        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::Failed);
        assert_eq!(snapshot.session.steps[0].status, StepStatus::Failed);
        assert_eq!(snapshot.coach_update.status, CoachStatus::Failed);
        assert!(engine.report(&sid).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_stage_failure_count() {
        let llm = scripted(&[
            "garbage", "garbage", // 第一次 push_frame 失败
            DIAL_UNSET, SET_DIAL, // 重试成功
        ]);
        let engine = engine(llm, Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;

        assert!(engine.push_frame(&sid, frame(1)).await.unwrap_err().is_retriable());
        engine.push_frame(&sid, frame(1)).await.unwrap();
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert!(session.stage_failures.is_none());
        assert_eq!(session.state, LifecycleState::AwaitingEvidence);
    }

    #[tokio::test]
    async fn test_idempotent_start() {
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine(Arc::new(MockLlmClient), kv.clone());
        let req = StartSession {
            goal: "Wash clothes".into(),
            language: None,
            idempotency_key: Some("client-42".into()),
        };
        let a = engine.start_session(req.clone()).await.unwrap();
        let b = engine.start_session(req).await.unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(kv.scan_prefix("session/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_question_answer_and_stale_reference() {
        let llm = scripted(&[
            DIAL_UNSET,
            r#"{"question": {"text": "Is the garment silk?", "answer_shape": "yes_no"}}"#,
            "garbage",
            "garbage",
            SET_DIAL,
        ]);
        let engine = engine(llm, Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes - delicates")).await.unwrap().session_id;

        let out = engine.push_frame(&sid, frame(1)).await.unwrap();
        let question = out.coach_update.question.unwrap();
        assert!(question.id.starts_with("q_"));

        let err = engine.answer_question(&sid, "q_wrong", "yes").await.unwrap_err();
        assert!(matches!(err, CoachError::StaleReference(_)));

        // Planner 失败：问题保持待定
        assert!(engine.answer_question(&sid, &question.id, "yes").await.unwrap_err().is_retriable());
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.pending_question.as_ref().map(|q| q.id.as_str()), Some(question.id.as_str()));
        assert_eq!(session.state, LifecycleState::AwaitingAnswer);

        let update = engine.answer_question(&sid, &question.id, "yes").await.unwrap();
        assert!(update.question.is_none());
        assert_eq!(update.status, CoachStatus::VerifyStep);
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.answers.len(), 1);
        assert_eq!(session.answers[0].answer, "yes");
    }

    #[tokio::test]
    async fn test_frame_while_awaiting_answer_is_recorded_not_planned() {
        let llm = scripted(&[
            DIAL_UNSET,
            r#"{"question": {"text": "Top or front loader?", "answer_shape": "choice", "options": ["top", "front"]}}"#,
            DIAL_UNSET,
        ]);
        let engine = engine(llm.clone(), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let out = engine.push_frame(&sid, frame(2)).await.unwrap();
        assert!(out.coach_update.question.is_some());
        assert_eq!(llm.calls(), 3);
        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.rolling_window.len(), 2);
        assert_eq!(snapshot.session.state, LifecycleState::AwaitingAnswer);
    }

    #[tokio::test]
    async fn test_safety_warning_blocks_until_confirmed() {
        let llm = scripted(&[
            DIAL_UNSET,
            r#"{"next_step": {"title": "Unplug", "instruction": "Unplug the machine before opening the panel",
                "success_criteria": [{"subject": "plug", "expected": "out of socket"}]},
                "safety_warnings": ["Do not touch the socket with wet hands"]}"#,
            PASS,
        ]);
        let engine = engine(llm, Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Clean the filter")).await.unwrap().session_id;

        let out = engine.push_frame(&sid, frame(1)).await.unwrap();
        assert_eq!(out.coach_update.status, CoachStatus::SafetyHold);
        assert_eq!(out.coach_update.safety_warnings.len(), 1);

        let err = engine.verify_step(&sid, "step_001", "ev.jpg").await.unwrap_err();
        assert!(matches!(
            err,
            CoachError::InvalidState {
                state: LifecycleState::AwaitingSafetyConfirmation,
                ..
            }
        ));

        let update = engine.confirm_safety(&sid).await.unwrap();
        assert_eq!(update.status, CoachStatus::VerifyStep);
        assert!(update.safety_warnings.is_empty());
        let pass = engine.verify_step(&sid, "step_001", "ev.jpg").await.unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_existing_artifact_is_never_overwritten() {
        let llm = scripted(&[DIAL_UNSET, SET_DIAL, PASS]);
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine(llm, kv.clone());
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let key = format!("artifact/{sid}/step_001/000001");
        kv.put(&key, b"{\"existing\": true}".to_vec()).await.unwrap();

        let pass = engine.verify_step(&sid, "step_001", "ev.jpg").await.unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
        assert_eq!(kv.get(&key).await.unwrap(), Some(b"{\"existing\": true}".to_vec()));
        assert!(kv
            .get(&format!("artifact/{sid}/step_001/000002"))
            .await
            .unwrap()
            .is_some());
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.steps[0].verification_count, 2);
    }

    #[tokio::test]
    async fn test_skip_step_returns_to_awaiting_frame() {
        let engine = engine(Arc::new(MockLlmClient), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Tidy desk")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        let update = engine.skip_step(&sid, "step_001").await.unwrap();
        assert_eq!(update.status, CoachStatus::NeedsInput);
        assert!(update.active_step.is_none());
        let report = engine.report(&sid).await.unwrap();
        assert_eq!(report.checklist[0].status, StepStatus::Skipped);

        // 下一帧产生新步骤
        let out = engine.push_frame(&sid, frame(2)).await.unwrap();
        assert_eq!(out.coach_update.active_step.unwrap().step_id, "step_002");
    }

    #[tokio::test]
    async fn test_abandonment_rejects_mutations_but_stays_readable() {
        let engine = engine(Arc::new(MockLlmClient), Arc::new(MemoryKvStore::new()));
        let sid = engine.start_session(start("Tidy desk")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        assert!(engine.abandon_inactive(Utc::now()).await.unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(engine.abandon_inactive(later).await.unwrap(), vec![sid.clone()]);

        let err = engine.push_frame(&sid, frame(2)).await.unwrap_err();
        assert!(matches!(
            err,
            CoachError::SessionClosed {
                state: LifecycleState::Abandoned,
                ..
            }
        ));
        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::Abandoned);
        assert_eq!(snapshot.rolling_window.len(), 1);
        assert_eq!(engine.report(&sid).await.unwrap().state, LifecycleState::Abandoned);
    }

    #[tokio::test]
    async fn test_abandonment_waits_for_in_flight_transition() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            ScriptedReply::Delayed(Duration::from_millis(150), DIAL_UNSET.to_string()),
            ScriptedReply::text(SET_DIAL),
        ]));
        let engine = Arc::new(engine(llm, Arc::new(MemoryKvStore::new())));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;

        let pushing = {
            let engine = Arc::clone(&engine);
            let sid = sid.clone();
            tokio::spawn(async move { engine.push_frame(&sid, frame(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let later = Utc::now() + chrono::Duration::hours(2);
        let abandoned = engine.abandon_inactive(later).await.unwrap();
        let pushed = pushing.await.unwrap();

        // 帧在放弃之前完整提交
        assert!(pushed.is_ok());
        assert_eq!(abandoned, vec![sid.clone()]);
        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::Abandoned);
        assert_eq!(snapshot.rolling_window.len(), 1);
        assert_eq!(snapshot.session.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("realitycheck.db");

        let sid = {
            let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
            let engine = engine(scripted(&[DIAL_UNSET, SET_DIAL]), kv);
            let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
            engine.push_frame(&sid, frame(1)).await.unwrap();
            sid
        };

        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
        let engine = engine(scripted(&[PASS]), kv);
        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::AwaitingEvidence);
        assert_eq!(snapshot.rolling_window[0].scene_summary, "washing machine, dial unset");

        // 重启后分区懒加载：重复序号仍被识别
        let dup = engine.push_frame(&sid, frame(1)).await.unwrap();
        assert!(dup.duplicate);
        let pass = engine.verify_step(&sid, "step_001", "ev.jpg").await.unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_replaying_evicted_frame_is_duplicate() {
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine_with_capacity(Arc::new(MockLlmClient), kv.clone(), 2);
        let sid = engine.start_session(start("Tidy desk")).await.unwrap().session_id;
        for seq in 1..=3 {
            engine.push_frame(&sid, frame(seq)).await.unwrap();
        }
        let before = engine.resume_session(&sid).await.unwrap();
        let entries = kv.len().await;

        let replay = engine.push_frame(&sid, frame(1)).await.unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.coach_update, before.coach_update);
        assert_eq!(engine.resume_session(&sid).await.unwrap(), before);
        assert_eq!(kv.len().await, entries);

        let window: Vec<u64> = before.rolling_window.iter().map(|o| o.sequence).collect();
        assert_eq!(window, vec![2, 3]);
        assert!(!engine.push_frame(&sid, frame(4)).await.unwrap().duplicate);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_does_not_wedge_step() {
        let llm = scripted(&[
            DIAL_UNSET,
            SET_DIAL,
            r#"{"verdict": "fail", "reason": "Dial on Cotton", "correction": "Turn the dial to Delicate"}"#,
            PASS,
        ]);
        let kv = Arc::new(FlakySnapshotStore::default());
        let engine = engine(llm.clone(), kv.clone());
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();

        kv.fail_next_snapshot.store(true, Ordering::SeqCst);
        let err = engine.verify_step(&sid, "step_001", "ev-1.jpg").await.unwrap_err();
        assert!(matches!(err, CoachError::Store(_)));
        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.state, LifecycleState::AwaitingEvidence);
        assert_eq!(session.steps[0].verification_count, 0);

        // 审计日志已有 attempt 1，下一次核验写 attempt 2
        let pass = engine.verify_step(&sid, "step_001", "ev-2.jpg").await.unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
        let artifacts = engine.artifacts().artifacts(&sid).await.unwrap();
        let attempts: Vec<u32> = artifacts.iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(artifacts[0].verdict, Verdict::Fail);
        assert_eq!(llm.calls(), 4);

        let session = engine.resume_session(&sid).await.unwrap().session;
        assert_eq!(session.steps[0].status, StepStatus::Verified);
        assert_eq!(session.steps[0].verification_count, 2);
    }

    #[tokio::test]
    async fn test_artifact_keeps_observation_after_eviction() {
        let llm = scripted(&[
            DIAL_UNSET,
            SET_DIAL,
            r#"{"verdict": "fail", "reason": "Dial on Cotton", "correction": "Turn the dial to Delicate"}"#,
            r#"{"scene_summary": "hand on the dial", "state_estimate": {"dial": "moving"}, "state_delta": {}}"#,
            SET_DIAL,
        ]);
        let kv = Arc::new(MemoryKvStore::new());
        let engine = engine_with_capacity(llm, kv.clone(), 1);
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        engine.push_frame(&sid, frame(1)).await.unwrap();
        engine.verify_step(&sid, "step_001", "ev-1.jpg").await.unwrap();
        engine.push_frame(&sid, frame(2)).await.unwrap();

        assert_eq!(kv.scan_prefix(&format!("obs/{sid}/")).await.unwrap().len(), 1);
        let artifacts = engine.artifacts().artifacts(&sid).await.unwrap();
        assert_eq!(artifacts[0].observation_sequence, Some(1));
        assert_eq!(
            artifacts[0].scene_summary.as_deref(),
            Some("washing machine, dial unset")
        );
        assert_eq!(artifacts[0].state_estimate["dial"], "unset");
    }

    #[tokio::test]
    async fn test_concurrent_frames_on_one_session_are_queued() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            ScriptedReply::Delayed(Duration::from_millis(150), DIAL_UNSET.to_string()),
            ScriptedReply::text(SET_DIAL),
            ScriptedReply::text(DIAL_UNSET),
            ScriptedReply::text(SET_DIAL),
        ]));
        let engine = Arc::new(engine(llm.clone(), Arc::new(MemoryKvStore::new())));
        let sid = engine.start_session(start("Wash clothes")).await.unwrap().session_id;

        let push = |seq: u64| {
            let engine = Arc::clone(&engine);
            let sid = sid.clone();
            tokio::spawn(async move { engine.push_frame(&sid, frame(seq)).await })
        };
        let first = push(1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = push(2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 第二帧在会话锁上排队，尚未发起阶段调用
        assert_eq!(llm.calls(), 1);

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!((first.sequence, first.duplicate), (1, false));
        assert_eq!((second.sequence, second.duplicate), (2, false));
        assert_eq!(llm.calls(), 4);

        let snapshot = engine.resume_session(&sid).await.unwrap();
        let window: Vec<u64> = snapshot.rolling_window.iter().map(|o| o.sequence).collect();
        assert_eq!(window, vec![1, 2]);
        assert_eq!(snapshot.session.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_session_does_not_block_others() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            ScriptedReply::Delayed(Duration::from_millis(400), DIAL_UNSET.to_string()),
            ScriptedReply::text(DIAL_UNSET),
            ScriptedReply::text(SET_DIAL),
            ScriptedReply::text(SET_DIAL),
        ]));
        let engine = Arc::new(engine(llm, Arc::new(MemoryKvStore::new())));
        let a = engine.start_session(start("Wash clothes")).await.unwrap().session_id;
        let b = engine.start_session(start("Wash towels")).await.unwrap().session_id;

        let blocked = {
            let engine = Arc::clone(&engine);
            let a = a.clone();
            tokio::spawn(async move { engine.push_frame(&a, frame(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let other = tokio::time::timeout(Duration::from_millis(200), engine.push_frame(&b, frame(1)))
            .await
            .expect("session b must not wait for session a")
            .unwrap();
        assert_eq!(other.coach_update.status, CoachStatus::VerifyStep);
        assert!(!blocked.is_finished());

        let blocked = blocked.await.unwrap().unwrap();
        assert_eq!(blocked.coach_update.status, CoachStatus::VerifyStep);
    }
}
