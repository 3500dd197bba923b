//! RealityCheck - 命令行教练会话
//!
//! 入口：初始化日志与引擎，从 stdin 读取命令驱动一个会话。
//! 帧与证据以引用（文件名 / URL）给出；未配置 OPENAI_API_KEY 时使用 Mock LLM。

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use realitycheck::config::load_config;
use realitycheck::core::EngineBuilder;
use realitycheck::session::{CoachUpdate, FrameSubmission, SessionEngine, StartSession};

const HELP: &str = "Commands:
  start <goal>                 start a new session
  frame <image_ref> [words]    push a camera frame (optional transcript)
  answer <text>                answer the pending question
  verify <evidence_ref>        submit evidence for the active step
  confirm                      confirm the safety warning
  skip                         skip the active step
  resume                       show the session snapshot
  report                       show the session report
  quit";

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

fn show(update: &CoachUpdate) {
    println!("[{:?}] {}", update.status, update.message);
    if let Some(step) = &update.active_step {
        println!("  step {}: {}", step.step_id, step.title);
    }
    if let Some(q) = &update.question {
        println!("  question: {}", q.text);
    }
    for w in &update.safety_warnings {
        println!("  SAFETY: {w}");
    }
    if let Some(req) = &update.verification_request {
        println!("  evidence: {req}");
    }
}

/// REPL 状态：当前会话与下一帧序号
struct Repl {
    engine: SessionEngine,
    session_id: Option<String>,
    next_sequence: u64,
    last_update: Option<CoachUpdate>,
}

impl Repl {
    fn session(&self) -> anyhow::Result<&str> {
        self.session_id
            .as_deref()
            .context("no session yet, use `start <goal>`")
    }

    async fn handle(&mut self, cmd: &str, rest: &str) -> anyhow::Result<()> {
        match cmd {
            "start" => {
                let started = self
                    .engine
                    .start_session(StartSession {
                        goal: rest.to_string(),
                        language: None,
                        idempotency_key: None,
                    })
                    .await?;
                println!("session {}", started.session_id);
                show(&started.coach_update);
                self.session_id = Some(started.session_id);
                self.next_sequence = 1;
                self.last_update = Some(started.coach_update);
            }
            "frame" => {
                let sid = self.session()?.to_string();
                let (image_ref, transcript) = match rest.split_once(' ') {
                    Some((r, t)) => (r.to_string(), Some(t.to_string())),
                    None => (rest.to_string(), None),
                };
                let outcome = self
                    .engine
                    .push_frame(
                        &sid,
                        FrameSubmission {
                            sequence: self.next_sequence,
                            image_ref,
                            transcript,
                        },
                    )
                    .await?;
                self.next_sequence += 1;
                show(&outcome.coach_update);
                self.last_update = Some(outcome.coach_update);
            }
            "answer" => {
                let sid = self.session()?.to_string();
                let question_id = self
                    .last_update
                    .as_ref()
                    .and_then(|u| u.question.as_ref())
                    .map(|q| q.id.clone())
                    .context("no pending question")?;
                let update = self.engine.answer_question(&sid, &question_id, rest).await?;
                show(&update);
                self.last_update = Some(update);
            }
            "verify" => {
                let sid = self.session()?.to_string();
                let step_id = self
                    .last_update
                    .as_ref()
                    .and_then(|u| u.active_step.as_ref())
                    .map(|s| s.step_id.clone())
                    .context("no active step")?;
                let outcome = self.engine.verify_step(&sid, &step_id, rest).await?;
                println!("verdict: {} ({})", outcome.verdict, outcome.reason);
                show(&outcome.coach_update);
                self.last_update = Some(outcome.coach_update);
            }
            "confirm" => {
                let sid = self.session()?.to_string();
                let update = self.engine.confirm_safety(&sid).await?;
                show(&update);
                self.last_update = Some(update);
            }
            "skip" => {
                let sid = self.session()?.to_string();
                let step_id = self
                    .last_update
                    .as_ref()
                    .and_then(|u| u.active_step.as_ref())
                    .map(|s| s.step_id.clone())
                    .context("no active step")?;
                let update = self.engine.skip_step(&sid, &step_id).await?;
                show(&update);
                self.last_update = Some(update);
            }
            "resume" => {
                let snapshot = self.engine.resume_session(self.session()?).await?;
                print_json(&snapshot);
                self.last_update = Some(snapshot.coach_update);
            }
            "report" => {
                let report = self.engine.report(self.session()?).await?;
                print_json(&report);
            }
            _ => println!("{HELP}"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    realitycheck::observability::init();

    let cfg = load_config(None).unwrap_or_default();
    let mut repl = Repl {
        engine: EngineBuilder::new(cfg)
            .build()
            .context("Failed to open session store")?,
        session_id: None,
        next_sequence: 1,
        last_update: None,
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        if cmd == "quit" || cmd == "exit" {
            break;
        }
        if let Err(e) = repl.handle(cmd, rest.trim()).await {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}
