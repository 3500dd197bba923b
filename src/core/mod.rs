//! 核心层：错误分类、引擎构建、优雅关闭

pub mod builder;
pub mod error;
pub mod shutdown;

pub use builder::{create_engine, EngineBuilder};
pub use error::{CoachError, SchemaError, StageFailure, StoreError};
pub use shutdown::{ShutdownManager, ShutdownReason};
