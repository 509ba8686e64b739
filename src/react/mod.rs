//! 认知层：动作解析、分层计划、Critic、提议者与过程事件

pub mod action;
pub mod critic;
pub mod events;
pub mod plan;
pub mod planner;
pub mod proposer;

pub use action::{Action, ActionKind};
pub use critic::{ActionCritique, SelfCritiqueSystem};
pub use events::AgentEvent;
pub use plan::{ActionPlan, Intent, PlanStatus, SubGoal, SubGoalStatus};
pub use planner::{classify_failure, ActionHint, HierarchicalPlanner, PlanMonitor, PlanPhase, PlannerMetrics};
pub use proposer::{ActionProposer, LlmProposer, Proposal, ProposalRequest, ScriptedProposer};
