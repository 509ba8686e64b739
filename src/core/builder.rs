//! Controller 构建器：统一的初始化逻辑
//!
//! 按配置组装 Critic、重试系统、Planner 与情景记忆；关闭的子系统以直通方式工作。
//! 配置了 persistence_dir 时，情景日志与规划指标都落在该目录下。
//! 并行运行时由调用方传入共享的 SharedEpisodicMemory，否则按配置新建（可选落盘）。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{ActionExecutor, AdaptiveRetrySystem, AgentError, Controller, EnvironmentAdapter};
use crate::memory::{EpisodicMemory, SharedEpisodicMemory};
use crate::react::{ActionProposer, AgentEvent, HierarchicalPlanner, SelfCritiqueSystem};

/// 按配置创建情景记忆；enable_memory = false 时返回 None
pub fn build_memory(config: &AppConfig) -> Result<Option<SharedEpisodicMemory>, AgentError> {
    if !config.enable_memory {
        return Ok(None);
    }
    let memory = match &config.persistence_dir {
        Some(dir) => EpisodicMemory::with_persistence(config.max_episodes, dir)?,
        None => EpisodicMemory::new(config.max_episodes),
    };
    Ok(Some(SharedEpisodicMemory::new(memory)))
}

pub struct ControllerBuilder {
    config: AppConfig,
    adapter: Arc<dyn EnvironmentAdapter>,
    proposer: Arc<dyn ActionProposer>,
    memory: Option<SharedEpisodicMemory>,
    cancel_token: Option<CancellationToken>,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl ControllerBuilder {
    pub fn new(
        config: AppConfig,
        adapter: Arc<dyn EnvironmentAdapter>,
        proposer: Arc<dyn ActionProposer>,
    ) -> Self {
        Self {
            config,
            adapter,
            proposer,
            memory: None,
            cancel_token: None,
            event_tx: None,
        }
    }

    /// 使用共享的情景记忆（多个 worker 共用）
    pub fn with_memory(mut self, memory: SharedEpisodicMemory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<Controller, AgentError> {
        let memory = if !self.config.enable_memory {
            None
        } else {
            match self.memory {
                Some(m) => Some(m),
                None => build_memory(&self.config)?,
            }
        };
        let planner = match &self.config.persistence_dir {
            Some(dir) if self.config.enable_planning => HierarchicalPlanner::with_persistence(dir)?,
            _ => HierarchicalPlanner::new(),
        };
        let critic = SelfCritiqueSystem::from_config(&self.config.critique);
        let retry = AdaptiveRetrySystem::from_config(&self.config);
        let executor = ActionExecutor::new(self.adapter, self.config.timeout_ms);
        tracing::debug!(
            "Building controller (memory: {}, planning: {}, critique: {})",
            memory.is_some(),
            self.config.enable_planning,
            self.config.enable_critique
        );
        Ok(Controller::new(
            self.config,
            executor,
            self.proposer,
            memory,
            planner,
            critic,
            retry,
            self.cancel_token.unwrap_or_default(),
            self.event_tx,
        ))
    }
}
