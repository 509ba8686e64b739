//! 并行 episode 调度：Semaphore 限制并发，所有 worker 共享同一份情景记忆
//!
//! 每个 episode 有自己的 Controller、WorkingMemory 与 Planner；取消通过 SessionSupervisor 的子 token 传递。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::core::{
    build_memory, AgentError, ControllerBuilder, EnvironmentAdapter, EpisodeOutcome, SessionSupervisor,
};
use crate::memory::{Observation, SharedEpisodicMemory};
use crate::react::{ActionProposer, AgentEvent};

/// 一个待运行的 episode：目标、初始观察与该 episode 独占的环境/提议者
pub struct EpisodeTask {
    pub goal: String,
    pub domain: String,
    pub initial: Observation,
    pub adapter: Arc<dyn EnvironmentAdapter>,
    pub proposer: Arc<dyn ActionProposer>,
}

impl EpisodeTask {
    pub fn new(
        goal: impl Into<String>,
        domain: impl Into<String>,
        initial: Observation,
        adapter: Arc<dyn EnvironmentAdapter>,
        proposer: Arc<dyn ActionProposer>,
    ) -> Self {
        Self {
            goal: goal.into(),
            domain: domain.into(),
            initial,
            adapter,
            proposer,
        }
    }
}

pub struct EpisodeRunner {
    config: AppConfig,
    memory: Option<SharedEpisodicMemory>,
    semaphore: Arc<Semaphore>,
    supervisor: SessionSupervisor,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl EpisodeRunner {
    pub fn new(config: AppConfig) -> Result<Self, AgentError> {
        let memory = build_memory(&config)?;
        Ok(Self::with_memory(config, memory))
    }

    /// 使用已有的共享记忆（None 表示关闭记忆）
    pub fn with_memory(config: AppConfig, memory: Option<SharedEpisodicMemory>) -> Self {
        let permits = config.controller.max_concurrent_episodes.max(1);
        Self {
            config,
            memory,
            semaphore: Arc::new(Semaphore::new(permits)),
            supervisor: SessionSupervisor::new(),
            event_tx: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn memory(&self) -> Option<&SharedEpisodicMemory> {
        self.memory.as_ref()
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    /// 运行全部 episode，结果按输入顺序返回
    pub async fn run_all(&self, tasks: Vec<EpisodeTask>) -> Vec<EpisodeOutcome> {
        let labels: Vec<(String, String)> = tasks
            .iter()
            .map(|t| (t.goal.clone(), t.domain.clone()))
            .collect();
        let mut outcomes: Vec<Option<EpisodeOutcome>> = vec![None; tasks.len()];
        let mut set = JoinSet::new();

        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let mut builder = ControllerBuilder::new(self.config.clone(), task.adapter, task.proposer)
                .with_cancel_token(self.supervisor.child_token());
            if let Some(memory) = &self.memory {
                builder = builder.with_memory(memory.clone());
            }
            if let Some(tx) = &self.event_tx {
                builder = builder.with_event_tx(tx.clone());
            }

            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (
                        index,
                        EpisodeOutcome::abandoned(&task.goal, &task.domain, "runner shut down"),
                    );
                };
                let outcome = match builder.build() {
                    Ok(mut controller) => {
                        controller
                            .run_episode(&task.goal, &task.domain, task.initial)
                            .await
                    }
                    Err(e) => {
                        tracing::error!("Failed to build controller for '{}': {}", task.goal, e);
                        EpisodeOutcome::abandoned(&task.goal, &task.domain, e.to_string())
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => tracing::error!("Episode task failed: {}", e),
            }
        }

        outcomes
            .into_iter()
            .zip(labels)
            .map(|(outcome, (goal, domain))| {
                outcome.unwrap_or_else(|| EpisodeOutcome::abandoned(goal, domain, "episode task panicked"))
            })
            .collect()
    }
}
