//! 核心层：错误分类、重试策略、环境适配器、Controller 主循环与并行调度

pub mod adapter;
pub mod builder;
pub mod controller;
pub mod error;
pub mod retry;
pub mod runner;
pub mod session_supervisor;
pub mod state;

pub use adapter::{ActionExecutor, EnvironmentAdapter, ScriptedEnvironment, ScriptedStep, StepResult};
pub use builder::{build_memory, ControllerBuilder};
pub use controller::Controller;
pub use error::{AdapterError, AgentError, ErrorKind};
pub use retry::{AdaptiveRetrySystem, RetryContext, RetryStrategy, StrategyType};
pub use runner::{EpisodeRunner, EpisodeTask};
pub use session_supervisor::SessionSupervisor;
pub use state::{ControllerPhase, ControllerSnapshot, EpisodeOutcome, StepOutcome, TerminalStatus};
