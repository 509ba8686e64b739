//! 计划数据模型：SubGoal 与 ActionPlan
//!
//! ActionPlan 以数组持有有序子目标，聚合状态靠扫描数组计算，不需要反向引用。
//! 子目标状态只能单调推进：Pending → Active → {Done, Failed, Skipped}，或 Pending → Skipped。

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Goal;
use crate::react::ActionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGoalStatus {
    Pending,
    Active,
    Done,
    Failed,
    Skipped,
}

impl SubGoalStatus {
    /// 尚未结束（可以成为当前子目标）
    pub fn is_open(self) -> bool {
        matches!(self, SubGoalStatus::Pending | SubGoalStatus::Active)
    }

    pub fn can_transition(self, to: SubGoalStatus) -> bool {
        use SubGoalStatus::*;
        matches!(
            (self, to),
            (Pending, Active) | (Pending, Skipped) | (Active, Done) | (Active, Failed) | (Active, Skipped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubGoalStatus::Pending => "pending",
            SubGoalStatus::Active => "active",
            SubGoalStatus::Done => "done",
            SubGoalStatus::Failed => "failed",
            SubGoalStatus::Skipped => "skipped",
        }
    }
}

/// 子目标的意图：决定哪些动作类型能推进它
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Search,
    Inspect,
    Select,
    Navigate,
    Input,
    Submit,
    /// 兜底子目标（即目标本身）：只由提议者的终止消息完成
    Any,
}

impl Intent {
    pub fn accepts(self, kind: ActionKind) -> bool {
        use ActionKind::*;
        match self {
            Intent::Search => matches!(kind, Fill | Click | Goto),
            Intent::Inspect => matches!(kind, Click | Scroll | Goto),
            Intent::Select => matches!(kind, Click | SelectOption),
            Intent::Navigate => matches!(kind, Goto | Click),
            Intent::Input => matches!(kind, Fill | SelectOption),
            Intent::Submit => matches!(kind, Click),
            Intent::Any => matches!(kind, SendMessage),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubGoal {
    pub description: String,
    pub domain: String,
    /// 越小越紧急；按模板顺序分配
    pub priority: u32,
    pub status: SubGoalStatus,
    pub intent: Intent,
    /// 作为当前子目标时尝试过的动作次数
    pub attempts: u32,
    pub estimated_steps: u32,
    /// 重新规划追加的恢复子目标：记录它替代的失败子目标下标
    #[serde(default)]
    pub recovers: Option<usize>,
}

impl SubGoal {
    pub fn new(description: impl Into<String>, domain: impl Into<String>, priority: u32, intent: Intent) -> Self {
        Self {
            description: description.into(),
            domain: domain.into(),
            priority,
            status: SubGoalStatus::Pending,
            intent,
            attempts: 0,
            estimated_steps: 3,
            recovers: None,
        }
    }

    /// 作为 `failed` 子目标的恢复路径
    pub fn recovering(mut self, failed: usize) -> Self {
        self.recovers = Some(failed);
        self
    }

    pub fn transition(&mut self, to: SubGoalStatus) -> Result<(), AgentError> {
        if !self.status.can_transition(to) {
            return Err(AgentError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// 计划的聚合状态（由子目标推导）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Executing,
    /// 全部 done / skipped
    Completed,
    /// 存在 failed 子目标且没有剩余可执行的子目标
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub goal: Goal,
    /// 命中的任务模板名（兜底为 "catch_all"）
    pub template: String,
    pub subgoals: Vec<SubGoal>,
    /// 每次重新规划 +1
    pub revision: u32,
}

impl ActionPlan {
    pub fn new(goal: Goal, template: impl Into<String>, subgoals: Vec<SubGoal>) -> Self {
        let mut plan = Self {
            goal,
            template: template.into(),
            subgoals,
            revision: 0,
        };
        plan.activate_next();
        plan
    }

    /// done / skipped，以及恢复子目标已完成的 failed 子目标都算已结束；
    /// 仍有未被恢复的 failed 子目标且无可执行子目标时为 Failed
    pub fn status(&self) -> PlanStatus {
        if (0..self.subgoals.len()).all(|i| self.is_resolved(i)) {
            return PlanStatus::Completed;
        }
        let blocking = (0..self.subgoals.len())
            .any(|i| self.subgoals[i].status == SubGoalStatus::Failed && !self.is_resolved(i));
        let any_open = self.subgoals.iter().any(|g| g.status.is_open());
        if blocking && !any_open {
            PlanStatus::Failed
        } else {
            PlanStatus::Executing
        }
    }

    /// 子目标是否已结束且不阻塞计划；failed 子目标沿恢复链判断
    pub fn is_resolved(&self, idx: usize) -> bool {
        let mut current = idx;
        // 恢复子目标总排在被恢复者之后，链长不超过子目标数
        for _ in 0..=self.subgoals.len() {
            match self.subgoals[current].status {
                SubGoalStatus::Done | SubGoalStatus::Skipped => return true,
                SubGoalStatus::Failed => match self.recovery_of(current) {
                    Some(next) => current = next,
                    None => return false,
                },
                SubGoalStatus::Pending | SubGoalStatus::Active => return false,
            }
        }
        false
    }

    fn recovery_of(&self, idx: usize) -> Option<usize> {
        self.subgoals.iter().position(|g| g.recovers == Some(idx))
    }

    /// 当前子目标：第一个 pending / active 的子目标
    pub fn active_index(&self) -> Option<usize> {
        self.subgoals.iter().position(|g| g.status.is_open())
    }

    pub fn active(&self) -> Option<&SubGoal> {
        self.active_index().map(|i| &self.subgoals[i])
    }

    /// 把第一个未结束的子目标置为 Active（已是 Active 时不变）
    pub fn activate_next(&mut self) -> Option<usize> {
        let idx = self.active_index()?;
        if self.subgoals[idx].status == SubGoalStatus::Pending {
            self.subgoals[idx].status = SubGoalStatus::Active;
        }
        Some(idx)
    }

    /// 结束当前子目标（Done / Failed / Skipped）并激活下一个；返回被结束的下标
    pub fn finish_active(&mut self, to: SubGoalStatus) -> Result<Option<usize>, AgentError> {
        let Some(idx) = self.activate_next() else {
            return Ok(None);
        };
        self.subgoals[idx].transition(to)?;
        self.activate_next();
        Ok(Some(idx))
    }

    /// 记一次对当前子目标的尝试，返回累计次数
    pub fn record_attempt(&mut self) -> u32 {
        match self.activate_next() {
            Some(idx) => {
                self.subgoals[idx].attempts += 1;
                self.subgoals[idx].attempts
            }
            None => 0,
        }
    }

    /// (已完成数, 总数)；skipped 与已被恢复的 failed 计入已完成
    pub fn progress(&self) -> (usize, usize) {
        let done = (0..self.subgoals.len()).filter(|&i| self.is_resolved(i)).count();
        (done, self.subgoals.len())
    }

    pub fn descriptions(&self) -> Vec<&str> {
        self.subgoals.iter().map(|g| g.description.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ActionPlan {
        ActionPlan::new(
            Goal::new("find lamp", "catalog"),
            "t",
            vec![
                SubGoal::new("search", "catalog", 1, Intent::Search),
                SubGoal::new("select-item", "catalog", 2, Intent::Select),
            ],
        )
    }

    #[test]
    fn test_first_subgoal_active_on_creation() {
        let p = plan();
        assert_eq!(p.active_index(), Some(0));
        assert_eq!(p.subgoals[0].status, SubGoalStatus::Active);
        assert_eq!(p.subgoals[1].status, SubGoalStatus::Pending);
        assert_eq!(p.status(), PlanStatus::Executing);
    }

    #[test]
    fn test_finish_advances_and_completes() {
        let mut p = plan();
        assert_eq!(p.finish_active(SubGoalStatus::Done).unwrap(), Some(0));
        assert_eq!(p.active().map(|g| g.description.as_str()), Some("select-item"));
        p.finish_active(SubGoalStatus::Done).unwrap();
        assert_eq!(p.status(), PlanStatus::Completed);
        assert_eq!(p.finish_active(SubGoalStatus::Done).unwrap(), None);
        assert_eq!(p.progress(), (2, 2));
    }

    #[test]
    fn test_failed_without_open_subgoals_is_failed() {
        let mut p = plan();
        p.finish_active(SubGoalStatus::Done).unwrap();
        p.finish_active(SubGoalStatus::Failed).unwrap();
        assert_eq!(p.status(), PlanStatus::Failed);
    }

    #[test]
    fn test_completed_recovery_resolves_failed_subgoal() {
        let mut p = ActionPlan::new(
            Goal::new("ponder the void", "general"),
            "catch_all",
            vec![SubGoal::new("ponder the void", "general", 1, Intent::Any)],
        );
        p.finish_active(SubGoalStatus::Failed).unwrap();
        p.subgoals
            .push(SubGoal::new("retry-ponder the void", "general", 2, Intent::Any).recovering(0));
        p.activate_next();
        assert_eq!(p.status(), PlanStatus::Executing);

        p.finish_active(SubGoalStatus::Done).unwrap();
        assert!(p.is_resolved(0));
        assert_eq!(p.status(), PlanStatus::Completed);
        assert_eq!(p.progress(), (2, 2));
    }

    #[test]
    fn test_failed_recovery_chain_still_blocks() {
        let mut p = ActionPlan::new(
            Goal::new("ponder the void", "general"),
            "catch_all",
            vec![SubGoal::new("ponder the void", "general", 1, Intent::Any)],
        );
        p.finish_active(SubGoalStatus::Failed).unwrap();
        p.subgoals
            .push(SubGoal::new("retry-ponder the void", "general", 2, Intent::Any).recovering(0));
        p.finish_active(SubGoalStatus::Failed).unwrap();
        assert_eq!(p.status(), PlanStatus::Failed);

        p.subgoals
            .push(SubGoal::new("retry-ponder the void", "general", 3, Intent::Any).recovering(1));
        p.finish_active(SubGoalStatus::Skipped).unwrap();
        assert!(p.is_resolved(0));
        assert_eq!(p.status(), PlanStatus::Completed);
    }

    #[test]
    fn test_no_status_regression() {
        let mut g = SubGoal::new("x", "d", 1, Intent::Any);
        g.transition(SubGoalStatus::Active).unwrap();
        g.transition(SubGoalStatus::Done).unwrap();
        assert!(matches!(
            g.transition(SubGoalStatus::Active),
            Err(AgentError::InvalidTransition { .. })
        ));
        assert_eq!(g.status, SubGoalStatus::Done);
    }

    #[test]
    fn test_intent_accepts() {
        assert!(Intent::Search.accepts(ActionKind::Fill));
        assert!(!Intent::Select.accepts(ActionKind::Fill));
        assert!(!Intent::Any.accepts(ActionKind::Click));
        assert!(Intent::Any.accepts(ActionKind::SendMessage));
    }

    #[test]
    fn test_record_attempt_counts_active() {
        let mut p = plan();
        assert_eq!(p.record_attempt(), 1);
        assert_eq!(p.record_attempt(), 2);
        p.finish_active(SubGoalStatus::Done).unwrap();
        assert_eq!(p.record_attempt(), 1);
    }
}
