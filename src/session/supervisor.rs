//! 会话监管：后台按间隔清理超时会话
//!
//! 持有 CancellationToken，进程关闭时取消即停止清扫；每轮调用 `abandon_inactive`，
//! 放弃操作在会话锁下执行，因此不会打断进行中的转换。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SessionEngine;

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    interval: Duration,
}

impl SessionSupervisor {
    pub fn new(interval: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            interval,
        }
    }

    /// 使用外部 token（如 ShutdownManager 的子 token）
    pub fn with_token(interval: Duration, cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            interval,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 启动清扫任务，token 取消后退出
    pub fn spawn(&self, engine: Arc<SessionEngine>) -> JoinHandle<()> {
        let token = self.cancel_token.clone();
        let period = self.interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match engine.abandon_inactive(Utc::now()).await {
                            Ok(ids) if !ids.is_empty() => {
                                info!(count = ids.len(), "Abandoned inactive sessions");
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Session sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::session::{EngineSettings, LifecycleState, StageClients, StartSession};
    use crate::store::MemoryKvStore;

    #[tokio::test]
    async fn test_sweeper_abandons_and_stops() {
        let engine = Arc::new(SessionEngine::new(
            Arc::new(MemoryKvStore::new()),
            StageClients::shared(Arc::new(MockLlmClient)),
            EngineSettings {
                inactivity_timeout: Duration::ZERO,
                ..EngineSettings::default()
            },
        ));
        let sid = engine
            .start_session(StartSession {
                goal: "Water plants".into(),
                language: None,
                idempotency_key: None,
            })
            .await
            .unwrap()
            .session_id;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let supervisor = SessionSupervisor::new(Duration::from_millis(10));
        let handle = supervisor.spawn(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(60)).await;
        supervisor.cancel();
        handle.await.unwrap();

        let snapshot = engine.resume_session(&sid).await.unwrap();
        assert_eq!(snapshot.session.state, LifecycleState::Abandoned);
    }
}
