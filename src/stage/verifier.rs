//! Verifier Adapter：步骤 + 成功标准 + 证据 -> pass / fail / unclear

use std::fmt::Write as _;
use std::sync::Arc;

use crate::core::StageFailure;
use crate::llm::{LlmClient, Message};
use crate::session::{Observation, Step};
use crate::stage::contract::{contract_schema_json, Contract, VerifierOutput};
use crate::stage::retry::RetryPolicy;
use crate::stage::validator::validate_verifier;

const VERIFIER_ROLE: &str = "You are a verification agent checking if a step was completed correctly. \
Judge the evidence against every success criterion. \
Answer fail with exactly one correction action when a criterion is not met. \
Answer unclear, and say which angle or lighting to capture, when the evidence is not good enough to judge.";

pub struct VerificationContext<'a> {
    pub step: &'a Step,
    pub evidence_ref: &'a str,
    /// 核验时最新的观测
    pub latest: Option<&'a Observation>,
}

pub struct VerifierAdapter {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl VerifierAdapter {
    pub fn new(llm: Arc<dyn LlmClient>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }

    pub async fn verify(&self, ctx: VerificationContext<'_>) -> Result<VerifierOutput, StageFailure> {
        let messages = vec![
            Message::system(format!(
                "{VERIFIER_ROLE}\n\nOutput ONLY one JSON object matching this schema:\n{}",
                contract_schema_json(Contract::Verifier)
            )),
            Message::user(build_prompt(&ctx)),
        ];
        self.retry
            .run(Contract::Verifier, self.llm.as_ref(), messages, validate_verifier)
            .await
    }
}

fn build_prompt(ctx: &VerificationContext<'_>) -> String {
    let step = ctx.step;
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Step to verify: {}", step.title);
    let _ = writeln!(prompt, "Instruction: {}", step.instruction);
    let _ = writeln!(prompt, "Success criteria:");
    for c in &step.success_criteria {
        let _ = writeln!(prompt, "- {}: {}", c.subject, c.expected);
    }

    if let Some(obs) = ctx.latest {
        let _ = writeln!(prompt, "\nLatest perception:");
        let _ = writeln!(prompt, "- Scene: {}", obs.scene_summary);
        let _ = writeln!(
            prompt,
            "- State: {}",
            serde_json::Value::Object(obs.state_estimate.clone())
        );
        if !obs.uncertainties.is_empty() {
            let _ = writeln!(prompt, "- Uncertainties: {}", obs.uncertainties.join("; "));
        }
    }

    if !step.corrections.is_empty() {
        let _ = writeln!(prompt, "\nPrevious corrections: {}", step.corrections.join("; "));
    }

    let _ = writeln!(prompt, "\nEvidence: {}", ctx.evidence_ref);
    prompt
}
