//! 会话层：数据模型、观测存储、审计记录、状态机与超时监管

pub mod artifact;
pub mod engine;
pub mod model;
pub mod observation;
pub mod supervisor;

pub use artifact::{
    ArtifactRecorder, ChecklistItem, CorrectionEntry, SessionReport, StepReport, VerdictEntry,
    VerificationArtifact,
};
pub use engine::{
    EngineSettings, FrameOutcome, SessionEngine, SessionStarted, StageClients, StartSession,
    VerifyOutcome,
};
pub use model::{
    AnsweredQuestion, CoachStatus, CoachUpdate, FrameSubmission, LifecycleState, Question,
    Session, SessionId, SessionSnapshot, StageFailureMark, Step, StepStatus, StepView,
};
pub use observation::{
    AcceptedSequences, AppendOutcome, Observation, ObservationStore, SequenceCheck,
};
pub use supervisor::SessionSupervisor;
