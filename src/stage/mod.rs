//! 推理阶段：契约、校验、重试与三个 Adapter
//!
//! 阶段之间互相隔离：感知只描述所见，Planner 只决策，Verifier 只判定。

pub mod contract;
pub mod perception;
pub mod planner;
pub mod retry;
pub mod validator;
pub mod verifier;

pub use contract::{
    contract_schema_json, AnswerShape, CoachDecision, CoachOutput, Contract, PerceptionOutput,
    QuestionPlan, StepPlan, SuccessCriterion, Verdict, VerifierOutput,
};
pub use perception::{FrameContext, PerceptionAdapter};
pub use planner::{PlannerAdapter, PlanningContext};
pub use retry::{RetryPolicy, MAX_STAGE_CALLS};
pub use validator::{
    extract_json, validate, validate_coach, validate_perception, validate_verifier,
    ValidatedOutput,
};
pub use verifier::{VerificationContext, VerifierAdapter};
