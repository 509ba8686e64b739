//! 状态定义：Controller 阶段、单步结果与 episode 结局
//!
//! 每个 episode 恰好产生一个 EpisodeOutcome，带最终计划状态、步数与最后一个错误。

use serde::Serialize;

use crate::react::{PlanStatus, SubGoalStatus};

/// Controller 阶段：
/// `idle → observing → proposing → executing → critiquing → (retrying)* → recording → {observing | terminating}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    Idle,
    Observing,
    Proposing,
    Executing,
    Critiquing,
    Retrying,
    Recording,
    Terminating,
}

/// Controller::step 的返回
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Terminate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalStatus {
    Completed,
    Abandoned,
    BudgetExhausted,
}

/// episode 结局摘要（不以错误形式返回）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EpisodeOutcome {
    pub episode_id: String,
    pub goal: String,
    pub domain: String,
    pub status: TerminalStatus,
    pub reason: String,
    pub plan_status: PlanStatus,
    pub subgoals: Vec<(String, SubGoalStatus)>,
    pub steps: usize,
    pub replans: u32,
    pub last_error: Option<String>,
}

impl EpisodeOutcome {
    /// 未能开始执行的 episode（如构建失败或任务崩溃）
    pub fn abandoned(goal: impl Into<String>, domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            episode_id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            domain: domain.into(),
            status: TerminalStatus::Abandoned,
            reason: reason.into(),
            plan_status: PlanStatus::Executing,
            subgoals: Vec::new(),
            steps: 0,
            replans: 0,
            last_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Completed
    }
}

/// 内部状态快照（供日志与前端展示）
#[derive(Clone, Debug, Serialize)]
pub struct ControllerSnapshot {
    pub phase: ControllerPhase,
    pub step: usize,
    pub max_steps: usize,
    pub active_subgoal: Option<String>,
    pub fingerprint: String,
    pub last_error: Option<String>,
}
