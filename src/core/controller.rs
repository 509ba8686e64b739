//! Controller：闭环认知控制主循环
//!
//! 每一步：指纹 → 召回 → 计划检查（停滞则重新规划）→ 提议 → 执行 → 自评 → 记录；
//! 失败或低效时分类错误并按 AdaptiveRetrySystem 的建议等待、换目标、重新规划或终止。
//! 同一 episode 的步骤严格串行，挂起点只有适配器调用与退避等待。
//! 取消（步数预算、墙钟超时、外部令牌）不打断进行中的适配器调用，之后直接进入 terminating，不再重试。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    ActionExecutor, AdaptiveRetrySystem, ControllerPhase, ControllerSnapshot, EpisodeOutcome,
    ErrorKind, RetryContext, StepOutcome, StrategyType, TerminalStatus,
};
use crate::memory::{Episode, Fingerprint, Observation, SharedEpisodicMemory, StateHasher, WorkingMemory};
use crate::react::{
    Action, ActionCritique, ActionProposer, AgentEvent, HierarchicalPlanner, PlanMonitor, PlanPhase,
    PlanStatus, Proposal, ProposalRequest, SelfCritiqueSystem, SubGoalStatus,
};

/// 替换目标时最多考虑的候选数
const MAX_ALTERNATIVES: usize = 3;

/// 等待重试的动作
#[derive(Debug, Clone)]
struct PendingRetry {
    action: Action,
    /// 下一次执行是第几次尝试
    attempt: u32,
}

pub struct Controller {
    config: AppConfig,
    hasher: StateHasher,
    memory: Option<SharedEpisodicMemory>,
    working: WorkingMemory,
    planner: HierarchicalPlanner,
    monitor: PlanMonitor,
    critic: SelfCritiqueSystem,
    retry: AdaptiveRetrySystem,
    executor: ActionExecutor,
    proposer: Arc<dyn ActionProposer>,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<AgentEvent>>,

    episode_id: String,
    phase: ControllerPhase,
    observation: Observation,
    fingerprint: Fingerprint,
    step: usize,
    deadline: Option<Instant>,
    pending: Option<PendingRetry>,
    last_error: Option<String>,
    terminal: Option<(TerminalStatus, String)>,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: AppConfig,
        executor: ActionExecutor,
        proposer: Arc<dyn ActionProposer>,
        memory: Option<SharedEpisodicMemory>,
        planner: HierarchicalPlanner,
        critic: SelfCritiqueSystem,
        retry: AdaptiveRetrySystem,
        cancel_token: CancellationToken,
        event_tx: Option<UnboundedSender<AgentEvent>>,
    ) -> Self {
        let monitor = PlanMonitor::new(
            config.planning.stall_threshold,
            config.planning.max_subgoal_attempts,
            config.planning.max_replans,
        );
        let hasher = StateHasher::new();
        let fingerprint = hasher.hash(&Observation::default());
        Self {
            config,
            hasher,
            memory,
            working: WorkingMemory::new(),
            planner,
            monitor,
            critic,
            retry,
            executor,
            proposer,
            cancel_token,
            event_tx,
            episode_id: String::new(),
            phase: ControllerPhase::Idle,
            observation: Observation::default(),
            fingerprint,
            step: 0,
            deadline: None,
            pending: None,
            last_error: None,
            terminal: None,
        }
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn plan_phase(&self) -> PlanPhase {
        self.monitor.phase()
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn planner(&self) -> &HierarchicalPlanner {
        &self.planner
    }

    pub fn observation(&self) -> &Observation {
        &self.observation
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            phase: self.phase,
            step: self.step,
            max_steps: self.config.max_steps,
            active_subgoal: self.working.active_subgoal().map(|g| g.description.clone()),
            fingerprint: self.fingerprint.to_string(),
            last_error: self.last_error.clone(),
        }
    }

    /// 运行一个完整 episode；总是返回结局摘要
    pub async fn run_episode(&mut self, goal: &str, domain: &str, initial: Observation) -> EpisodeOutcome {
        self.begin_episode(goal, domain, initial);
        while self.step().await == StepOutcome::Continue {}
        self.outcome()
    }

    /// episode 入口：set_goal + create_plan，idle → observing
    pub fn begin_episode(&mut self, goal: &str, domain: &str, initial: Observation) {
        self.episode_id = uuid::Uuid::new_v4().to_string();
        self.working.set_goal(goal, domain);
        let plan = if self.config.enable_planning {
            self.planner.create_plan(goal, domain, &initial)
        } else {
            HierarchicalPlanner::flat_plan(goal, domain)
        };
        self.working.set_plan(plan);
        self.monitor.plan_created();

        if let Some(url) = &initial.url {
            self.working.record_navigation(url.clone());
        }
        self.fingerprint = self.hasher.hash(&initial);
        self.observation = initial;
        self.step = 0;
        self.pending = None;
        self.last_error = None;
        self.terminal = None;
        self.deadline = match self.config.controller.episode_timeout_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };
        self.phase = ControllerPhase::Observing;
        tracing::info!("Episode {} started: {} (domain: {})", self.episode_id, goal, domain);
    }

    /// 执行一步
    pub async fn step(&mut self) -> StepOutcome {
        if self.terminal.is_some() || self.phase == ControllerPhase::Idle {
            return StepOutcome::Terminate;
        }
        if let Some((status, reason)) = self.cancellation() {
            return self.terminate(status, reason);
        }

        // observing
        self.phase = ControllerPhase::Observing;
        self.send(AgentEvent::StepUpdate {
            step: self.step + 1,
            max_steps: self.config.max_steps,
        });
        self.fingerprint = self.hasher.hash(&self.observation);
        self.send(AgentEvent::Fingerprint {
            fingerprint: self.fingerprint.to_string(),
        });

        if self.config.enable_planning && self.monitor.phase() == PlanPhase::Stalled {
            if let Some(outcome) = self.replan("plan stalled") {
                return outcome;
            }
        }
        if let Some(outcome) = self.check_plan() {
            return outcome;
        }

        let domain = self.domain();
        let (recalled, suggestion) = match &self.memory {
            Some(mem) => (
                mem.recall(&self.fingerprint, &domain, self.config.controller.recall_k),
                mem.best_action_for_state(&self.fingerprint, &domain),
            ),
            None => (Vec::new(), None),
        };
        self.send(AgentEvent::Recall {
            count: recalled.len(),
        });

        // proposing
        self.phase = ControllerPhase::Proposing;
        let (action, attempt) = match self.pending.take() {
            Some(p) => (p.action, p.attempt),
            None => match self.propose(&recalled, suggestion.as_ref()).await {
                Ok(Proposal::Action(a)) => (a, 1),
                Ok(Proposal::Terminal(message)) => return self.handle_terminal_message(message),
                Err(e) => {
                    tracing::warn!("Proposer failed: {}", e);
                    self.last_error = Some(e.to_string());
                    self.working.add_failure(format!("proposer: {}", e));
                    self.step += 1;
                    return StepOutcome::Continue;
                }
            },
        };
        self.send(AgentEvent::Proposal {
            action: action.raw.clone(),
            subgoal: self.working.active_subgoal().map(|g| g.description.clone()),
        });
        let active_attempts = self
            .working
            .plan_mut()
            .map(|p| p.record_attempt())
            .unwrap_or(0);

        // executing
        self.phase = ControllerPhase::Executing;
        let (result, elapsed) = self.executor.execute(&action, &self.observation).await;
        self.step += 1;
        let execution_time = elapsed.as_secs_f64();

        // critiquing
        self.phase = ControllerPhase::Critiquing;
        let error_message = result.error.as_ref().map(|e| e.to_string());
        let critique = if self.config.enable_critique {
            self.critic.evaluate(
                &action,
                &self.observation,
                &result.observation,
                execution_time,
                error_message.as_deref(),
            )
        } else {
            ActionCritique::neutral()
        };
        self.send(AgentEvent::Critique {
            action: action.raw.clone(),
            effectiveness: critique.effectiveness_score,
            confidence: critique.confidence_score,
        });
        let failure: Option<(ErrorKind, String)> = match &result.error {
            Some(e) => Some((e.kind, e.to_string())),
            None if !self.critic_accepts(&critique) => Some((
                ErrorKind::SoftFailure,
                format!(
                    "{}: effectiveness {:.2}",
                    ErrorKind::SoftFailure,
                    critique.effectiveness_score
                ),
            )),
            None => None,
        };

        // recording
        self.phase = ControllerPhase::Recording;
        let outcome_label = failure
            .as_ref()
            .map(|(_, msg)| msg.clone())
            .unwrap_or_else(|| "ok".to_string());
        self.remember(&action, &outcome_label, failure.is_none(), execution_time, critique.confidence_score);
        self.working.add_attempt(format!("{} -> {}", action, outcome_label));

        let before_fingerprint = self.fingerprint.clone();
        self.observation = result.observation;
        if let Some(url) = &self.observation.url {
            self.working.record_navigation(url.clone());
        }
        self.fingerprint = self.hasher.hash(&self.observation);
        tracing::debug!(
            "Step {}: {} ({} -> {}): {}",
            self.step,
            action,
            before_fingerprint,
            self.fingerprint,
            outcome_label
        );

        match failure {
            None => {
                self.pending = None;
                self.advance_subgoal(&action);
            }
            Some((kind, message)) => {
                self.last_error = Some(message.clone());
                self.working.add_failure(format!("{} -> {}", action, message));
                self.send(AgentEvent::ActionFailure {
                    action: action.raw.clone(),
                    kind: kind.to_string(),
                    reason: message,
                });
                let unchanged = before_fingerprint == self.fingerprint;
                if kind == ErrorKind::SoftFailure && unchanged && self.config.enable_planning {
                    // 状态未变的低效动作不消耗重试次数，由停滞检测决定何时重新规划
                    self.pending = None;
                    tracing::debug!("Soft failure on unchanged state {}, left to stall detection", self.fingerprint);
                } else if let Some(outcome) = self.apply_retry(kind, action, attempt).await {
                    return outcome;
                }
            }
        }

        if self.config.enable_planning {
            let attempts = self
                .working
                .active_subgoal()
                .map(|g| g.attempts)
                .unwrap_or(active_attempts);
            self.monitor.observe(&self.fingerprint, attempts);
        }

        match self.check_plan() {
            Some(outcome) => outcome,
            None => {
                self.phase = ControllerPhase::Observing;
                StepOutcome::Continue
            }
        }
    }

    /// 当前 episode 的结局摘要
    pub fn outcome(&self) -> EpisodeOutcome {
        let (status, reason) = self
            .terminal
            .clone()
            .unwrap_or((TerminalStatus::Abandoned, "episode not finished".to_string()));
        let goal = self.working.goal();
        EpisodeOutcome {
            episode_id: self.episode_id.clone(),
            goal: goal.map(|g| g.description.clone()).unwrap_or_default(),
            domain: goal.map(|g| g.domain.clone()).unwrap_or_default(),
            status,
            reason,
            plan_status: self
                .working
                .plan()
                .map(|p| p.status())
                .unwrap_or(PlanStatus::Executing),
            subgoals: self
                .working
                .subgoals()
                .iter()
                .map(|g| (g.description.clone(), g.status))
                .collect(),
            steps: self.step,
            replans: self.monitor.replans(),
            last_error: self.last_error.clone(),
        }
    }

    fn domain(&self) -> String {
        self.working
            .goal()
            .map(|g| g.domain.clone())
            .unwrap_or_else(|| self.config.controller.domain.clone())
    }

    fn critic_accepts(&self, critique: &ActionCritique) -> bool {
        !self.config.enable_critique || self.critic.is_effective(critique)
    }

    async fn propose(
        &self,
        recalled: &[Episode],
        suggestion: Option<&(String, f64)>,
    ) -> Result<Proposal, crate::core::AgentError> {
        let Some(goal) = self.working.goal() else {
            return Err(crate::core::AgentError::InvalidArgument(
                "no goal set for this episode".to_string(),
            ));
        };
        let memory_section = self.working.to_prompt_section();
        let hint = if self.config.enable_planning {
            self.working
                .active_subgoal()
                .and_then(|g| HierarchicalPlanner::next_action_hint(g, &self.observation))
        } else {
            None
        };
        let request = ProposalRequest {
            goal,
            observation: &self.observation,
            active_subgoal: self.working.active_subgoal(),
            recalled,
            memory_section: &memory_section,
            suggestion: suggestion.map(|(a, c)| (a.as_str(), *c)),
            hint: hint.as_ref(),
        };
        self.proposer.propose(request).await
    }

    fn remember(&self, action: &Action, outcome: &str, success: bool, execution_time: f64, confidence: f64) {
        let Some(mem) = &self.memory else {
            return;
        };
        let domain = self.domain();
        if let Err(e) = mem.store_episode(
            self.fingerprint.clone(),
            &action.raw,
            outcome,
            success,
            &domain,
            execution_time,
            confidence,
        ) {
            tracing::warn!("Failed to store episode: {}", e);
        }
    }

    /// 有效动作且符合当前子目标意图时，子目标完成并推进
    fn advance_subgoal(&mut self, action: &Action) {
        let Some(plan) = self.working.plan_mut() else {
            return;
        };
        let accepted = plan.active().map(|g| g.intent.accepts(action.kind)).unwrap_or(false);
        if !accepted {
            return;
        }
        match plan.finish_active(SubGoalStatus::Done) {
            Ok(Some(idx)) => {
                let description = plan.subgoals[idx].description.clone();
                tracing::info!("Sub-goal '{}' done", description);
                self.send(AgentEvent::SubGoalTransition {
                    description,
                    status: SubGoalStatus::Done,
                });
                self.monitor.progressed();
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Sub-goal transition rejected: {}", e),
        }
    }

    /// 按重试建议处理失败；返回 Some 表示 episode 在此终止
    async fn apply_retry(&mut self, kind: ErrorKind, action: Action, attempt: u32) -> Option<StepOutcome> {
        if let Some((status, reason)) = self.cancellation() {
            return Some(self.terminate(status, reason));
        }
        self.phase = ControllerPhase::Retrying;
        let alternatives = action
            .target()
            .map(|t| self.observation.alternative_targets(t, MAX_ALTERNATIVES))
            .unwrap_or_default();
        let context = RetryContext::new(action.raw.clone(), alternatives);
        let strategy = self.retry.create_retry_strategy(kind, &context, attempt);
        tracing::info!(
            "Retry strategy for {} (attempt {}/{}): {:?}, {}",
            action,
            attempt,
            strategy.max_attempts,
            strategy.strategy_type,
            strategy.reason
        );
        self.send(AgentEvent::Retry {
            strategy: strategy.strategy_type,
            attempt,
            delay_ms: strategy.delay.as_millis() as u64,
        });

        match strategy.strategy_type {
            StrategyType::Immediate => {
                self.pending = Some(PendingRetry {
                    action,
                    attempt: attempt + 1,
                });
            }
            StrategyType::Backoff => {
                if !self.wait(strategy.delay).await {
                    let (status, reason) = self
                        .cancellation()
                        .unwrap_or((TerminalStatus::Abandoned, "cancelled".to_string()));
                    return Some(self.terminate(status, reason));
                }
                self.pending = Some(PendingRetry {
                    action,
                    attempt: attempt + 1,
                });
            }
            StrategyType::AlternateTarget => {
                let next = match &strategy.alternate_target {
                    Some(target) => action.with_target(target),
                    None => action,
                };
                self.pending = Some(PendingRetry {
                    action: next,
                    attempt: attempt + 1,
                });
            }
            StrategyType::Replan => {
                self.pending = None;
                if self.config.enable_planning {
                    self.monitor.mark_stalled();
                }
            }
            StrategyType::Abort => {
                self.pending = None;
                let reason = format!("retry aborted: {}", strategy.reason);
                return Some(self.terminate(TerminalStatus::Abandoned, reason));
            }
        }
        None
    }

    /// 退避等待；被取消或超过墙钟期限时返回 false
    async fn wait(&self, delay: Duration) -> bool {
        let delay = match self.deadline {
            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
            None => delay,
        };
        tokio::select! {
            _ = self.cancel_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => self.cancellation().is_none(),
        }
    }

    /// stalled → replanning → executing；预算耗尽时终止
    fn replan(&mut self, reason: &str) -> Option<StepOutcome> {
        if !self.monitor.begin_replan() {
            return Some(self.terminate(
                TerminalStatus::Abandoned,
                format!("replan budget exhausted after {} replans", self.monitor.replans()),
            ));
        }
        let Some(current) = self.working.plan() else {
            self.monitor.replanned();
            return None;
        };
        let detail = match &self.last_error {
            Some(err) => format!("{}: {}", reason, err),
            None => reason.to_string(),
        };
        let next = self.planner.replan(current, &self.observation, &detail);
        for (old, new) in current.subgoals.iter().zip(next.subgoals.iter()) {
            if old.status != new.status {
                self.send(AgentEvent::SubGoalTransition {
                    description: new.description.clone(),
                    status: new.status,
                });
            }
        }
        self.send(AgentEvent::Replan {
            revision: next.revision,
            reason: detail,
        });
        self.working.set_plan(next);
        self.monitor.replanned();
        self.pending = None;
        None
    }

    /// 计划已完成或已无路可走时终止
    fn check_plan(&mut self) -> Option<StepOutcome> {
        let status = self.working.plan().map(|p| p.status())?;
        match status {
            PlanStatus::Completed => {
                self.monitor.complete();
                Some(self.terminate(TerminalStatus::Completed, "all sub-goals done".to_string()))
            }
            PlanStatus::Failed => {
                self.monitor.abandon();
                Some(self.terminate(
                    TerminalStatus::Abandoned,
                    "plan failed with no remaining sub-goals".to_string(),
                ))
            }
            PlanStatus::Executing => None,
        }
    }

    /// 提议者给出终止消息：兜底子目标由此完成；计划未完成则放弃
    fn handle_terminal_message(&mut self, message: String) -> StepOutcome {
        let action = Action::parse(&format!("send_msg_to_user('{}')", message.replace('\'', "\\'")));
        self.advance_subgoal(&action);
        match self.working.plan().map(|p| p.status()) {
            Some(PlanStatus::Completed) => {
                self.monitor.complete();
                self.terminate(TerminalStatus::Completed, message)
            }
            _ => {
                self.monitor.abandon();
                self.terminate(
                    TerminalStatus::Abandoned,
                    format!("proposer ended the episode: {}", message),
                )
            }
        }
    }

    /// 步数预算、墙钟超时或外部取消
    fn cancellation(&self) -> Option<(TerminalStatus, String)> {
        if self.cancel_token.is_cancelled() {
            return Some((TerminalStatus::Abandoned, "cancelled".to_string()));
        }
        if self.step >= self.config.max_steps {
            return Some((
                TerminalStatus::BudgetExhausted,
                format!("step budget of {} exhausted", self.config.max_steps),
            ));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some((
                TerminalStatus::BudgetExhausted,
                format!(
                    "episode timeout of {}ms exceeded",
                    self.config.controller.episode_timeout_ms
                ),
            ));
        }
        None
    }

    fn terminate(&mut self, status: TerminalStatus, reason: String) -> StepOutcome {
        self.phase = ControllerPhase::Terminating;
        self.pending = None;
        if self.terminal.is_none() {
            tracing::info!(
                "Episode {} finished: {:?} after {} steps ({})",
                self.episode_id,
                status,
                self.step,
                reason
            );
            if let Some(plan) = self.working.plan() {
                self.planner.record_plan_result(plan.status());
            }
            self.send(AgentEvent::Finished {
                status,
                steps: self.step,
            });
            self.terminal = Some((status, reason));
        }
        StepOutcome::Terminate
    }

    fn send(&self, event: AgentEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ControllerBuilder, ScriptedEnvironment};
    use crate::react::ScriptedProposer;

    fn controller(script: Vec<&str>) -> Controller {
        let env = Arc::new(ScriptedEnvironment::new(Observation::default(), Vec::new()));
        let proposer = Arc::new(ScriptedProposer::new(script));
        ControllerBuilder::new(AppConfig::default(), env, proposer)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_step_before_begin_terminates() {
        let mut c = controller(vec!["noop()"]);
        assert_eq!(c.phase(), ControllerPhase::Idle);
        assert_eq!(c.step().await, StepOutcome::Terminate);
        assert_eq!(c.steps(), 0);
    }

    #[tokio::test]
    async fn test_terminal_proposal_completes_catch_all() {
        let mut c = controller(vec!["send_msg_to_user('done')"]);
        c.begin_episode("say hello", "general", Observation::new("https://a.test/", "A"));
        assert_eq!(c.step().await, StepOutcome::Terminate);
        let outcome = c.outcome();
        assert_eq!(outcome.status, TerminalStatus::Completed);
        assert_eq!(outcome.reason, "done");
        assert_eq!(outcome.steps, 0);
        assert_eq!(c.phase(), ControllerPhase::Terminating);
        // 终止后再调用 step 不再执行
        assert_eq!(c.step().await, StepOutcome::Terminate);
    }

    #[tokio::test]
    async fn test_terminal_proposal_with_open_plan_abandons() {
        let mut c = controller(vec!["send_msg_to_user('cannot find it')"]);
        c.begin_episode("find a blue mug", "catalog", Observation::new("https://a.test/", "A"));
        c.step().await;
        let outcome = c.outcome();
        assert_eq!(outcome.status, TerminalStatus::Abandoned);
        assert!(outcome.reason.contains("cannot find it"));
        assert_eq!(outcome.plan_status, PlanStatus::Executing);
    }

    #[tokio::test]
    async fn test_snapshot_tracks_progress() {
        let mut c = controller(vec!["noop()"]);
        c.begin_episode("say hello", "general", Observation::new("https://a.test/", "A"));
        let snap = c.snapshot();
        assert_eq!(snap.step, 0);
        assert_eq!(snap.max_steps, 25);
        assert_eq!(snap.active_subgoal.as_deref(), Some("say hello"));
        assert_eq!(snap.fingerprint.len(), 16);
    }
}
