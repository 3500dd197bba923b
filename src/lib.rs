//! RealityCheck - 现实任务教练会话引擎
//!
//! 用离散的相机帧与简短文本交互，指导用户完成多步骤的现实任务（如洗衣），
//! 每一步都以证据图片核验。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、引擎构建、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **observability**: tracing 日志初始化
//! - **session**: 会话模型、观测存储、审计记录、状态机、超时监管
//! - **stage**: 三个推理阶段（感知 / 规划 / 核验）的契约、校验与重试
//! - **store**: 键值存储抽象（内存 / SQLite）

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod session;
pub mod stage;
pub mod store;

pub use crate::core::{CoachError, EngineBuilder};
pub use crate::session::{FrameSubmission, SessionEngine, StartSession};
