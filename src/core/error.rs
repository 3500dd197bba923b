//! 错误分类与传播
//!
//! 推理阶段的原始错误（网络、解析、超时）在 Adapter 边界归类为 SchemaError / StageFailure；
//! 状态机与调用方只看到本文件定义的类型。

use thiserror::Error;

use crate::session::LifecycleState;
use crate::stage::Contract;

/// 阶段输出不符合契约（格式错误 / 违反结构规则），携带原始输出供重试策略使用
#[derive(Error, Debug, Clone)]
#[error("{contract} output rejected: {reason}")]
pub struct SchemaError {
    pub contract: Contract,
    pub reason: String,
    pub raw: String,
}

impl SchemaError {
    pub fn new(contract: Contract, reason: impl Into<String>, raw: &str) -> Self {
        Self {
            contract,
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

/// 重试耗尽：同一逻辑操作的两次调用都失败
#[derive(Error, Debug, Clone)]
#[error("{contract} stage failed after {attempts} calls: {last_error}")]
pub struct StageFailure {
    pub contract: Contract,
    pub attempts: u32,
    pub last_error: String,
    /// 最后一次的原始输出（超时或传输错误时为空）
    pub raw: Option<String>,
}

/// KV 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// 引擎对调用方暴露的错误
#[derive(Error, Debug)]
pub enum CoachError {
    /// 调用方输入不合法，在任何阶段调用之前拒绝
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    /// question_id / step_id 与当前会话不匹配，客户端需 resume 重新同步
    #[error("Stale reference: {0}")]
    StaleReference(String),

    /// 审计记录已存在，原记录保留
    #[error("Artifact conflict: {0}")]
    Conflict(String),

    #[error("Observation {sequence} is out of order (last accepted {last})")]
    OutOfOrder { sequence: u64, last: u64 },

    #[error("Operation {operation} not allowed in state {state:?}")]
    InvalidState {
        state: LifecycleState,
        operation: &'static str,
    },

    #[error("Session {session_id} is closed ({state:?})")]
    SessionClosed {
        session_id: String,
        state: LifecycleState,
    },

    /// 可重试：会话保持在调用前的稳定状态
    #[error(transparent)]
    Stage(#[from] StageFailure),

    /// 同一步骤连续两次 StageFailure，会话进入 Failed
    #[error("Session {session_id} failed: {reason}")]
    SessionFailed { session_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoachError {
    /// 传输层据此返回「请重试」信号
    pub fn is_retriable(&self) -> bool {
        matches!(self, CoachError::Stage(_))
    }
}
