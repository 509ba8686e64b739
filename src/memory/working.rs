//! 中期记忆：当前目标、计划与子目标状态、已尝试动作、失败原因
//!
//! 一个 episode 内有效，由 Controller 独占。用于拼入提议者 prompt
//! （Current Goal / Active Sub-goal / What has been tried / Failures），减少重复犯错。

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::react::{ActionPlan, SubGoal};

/// 导航历史上限
const MAX_NAVIGATION_HISTORY: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    pub domain: String,
}

impl Goal {
    pub fn new(description: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            domain: domain.into(),
        }
    }
}

/// 进度摘要
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub completion_percentage: f64,
    pub subgoals_remaining: usize,
    pub error_count: usize,
    pub elapsed_secs: f64,
}

#[derive(Clone, Debug, Default)]
pub struct WorkingMemory {
    goal: Option<Goal>,
    plan: Option<ActionPlan>,
    pub attempts: Vec<String>,
    pub failures: Vec<String>,
    navigation: VecDeque<String>,
    started_at: Option<Instant>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置目标并重置计划与进度；目标未变时什么也不做，返回 false
    pub fn set_goal(&mut self, description: impl Into<String>, domain: impl Into<String>) -> bool {
        let goal = Goal::new(description, domain);
        if self.goal.as_ref() == Some(&goal) {
            return false;
        }
        self.clear();
        self.goal = Some(goal);
        self.started_at = Some(Instant::now());
        true
    }

    pub fn goal(&self) -> Option<&Goal> {
        self.goal.as_ref()
    }

    /// 安装（或替换）当前计划；重新规划时整体替换
    pub fn set_plan(&mut self, plan: ActionPlan) {
        self.plan = Some(plan);
    }

    pub fn plan(&self) -> Option<&ActionPlan> {
        self.plan.as_ref()
    }

    pub fn plan_mut(&mut self) -> Option<&mut ActionPlan> {
        self.plan.as_mut()
    }

    /// 有序子目标；没有计划时为空
    pub fn subgoals(&self) -> &[SubGoal] {
        self.plan.as_ref().map(|p| p.subgoals.as_slice()).unwrap_or(&[])
    }

    /// 当前子目标：第一个 pending / active 的子目标
    pub fn active_subgoal(&self) -> Option<&SubGoal> {
        self.plan.as_ref().and_then(|p| p.active())
    }

    pub fn add_attempt(&mut self, attempt: impl Into<String>) {
        self.attempts.push(attempt.into());
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    /// 记录到达的页面；与上一条相同时不重复记录
    pub fn record_navigation(&mut self, url: impl Into<String>) {
        let url = url.into();
        if self.navigation.back() == Some(&url) {
            return;
        }
        self.navigation.push_back(url);
        while self.navigation.len() > MAX_NAVIGATION_HISTORY {
            self.navigation.pop_front();
        }
    }

    pub fn navigation_history(&self) -> impl Iterator<Item = &String> {
        self.navigation.iter()
    }

    pub fn clear(&mut self) {
        self.goal = None;
        self.plan = None;
        self.attempts.clear();
        self.failures.clear();
        self.navigation.clear();
        self.started_at = None;
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        let (done, total) = self.plan.as_ref().map(|p| p.progress()).unwrap_or((0, 0));
        ProgressSummary {
            completion_percentage: if total == 0 {
                0.0
            } else {
                done as f64 / total as f64 * 100.0
            },
            subgoals_remaining: total - done,
            error_count: self.failures.len(),
            elapsed_secs: self
                .started_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// 构建供提议者使用的 Prompt 片段（Current Goal / Active Sub-goal / What has been tried / Failures）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if let Some(goal) = &self.goal {
            s.push_str(&format!("## Current Goal\n{} (domain: {})\n\n", goal.description, goal.domain));
        }
        if let Some(plan) = &self.plan {
            let (done, total) = plan.progress();
            s.push_str(&format!("## Plan ({}/{} done)\n", done, total));
            for g in &plan.subgoals {
                s.push_str(&format!("- [{}] {}\n", g.status.as_str(), g.description));
            }
            s.push('\n');
        }
        if let Some(active) = self.active_subgoal() {
            s.push_str(&format!("## Active Sub-goal\n{}\n\n", active.description));
        }
        if !self.attempts.is_empty() {
            s.push_str("## What has been tried\n");
            for a in &self.attempts {
                s.push_str(&format!("- {}\n", a));
            }
            s.push('\n');
        }
        if !self.failures.is_empty() {
            s.push_str("## Failures\n");
            for f in &self.failures {
                s.push_str(&format!("- {}\n", f));
            }
            s.push('\n');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::{Intent, SubGoalStatus};

    fn plan_for(goal: &Goal) -> ActionPlan {
        ActionPlan::new(
            goal.clone(),
            "t",
            vec![
                SubGoal::new("search", &goal.domain, 1, Intent::Search),
                SubGoal::new("select-item", &goal.domain, 2, Intent::Select),
            ],
        )
    }

    #[test]
    fn test_set_goal_is_idempotent() {
        let mut wm = WorkingMemory::new();
        assert!(wm.set_goal("find lamp", "catalog"));
        let goal = wm.goal().cloned().unwrap();
        wm.set_plan(plan_for(&goal));
        wm.add_attempt("fill('q', 'lamp')");
        assert!(!wm.set_goal("find lamp", "catalog"));
        assert_eq!(wm.subgoals().len(), 2);
        assert_eq!(wm.attempts.len(), 1);

        assert!(wm.set_goal("find chair", "catalog"));
        assert!(wm.subgoals().is_empty());
        assert!(wm.attempts.is_empty());
    }

    #[test]
    fn test_active_subgoal_follows_plan() {
        let mut wm = WorkingMemory::new();
        wm.set_goal("find lamp", "catalog");
        let goal = wm.goal().cloned().unwrap();
        wm.set_plan(plan_for(&goal));
        assert_eq!(wm.active_subgoal().map(|g| g.description.as_str()), Some("search"));
        wm.plan_mut().unwrap().finish_active(SubGoalStatus::Done).unwrap();
        assert_eq!(wm.active_subgoal().map(|g| g.description.as_str()), Some("select-item"));
        let summary = wm.progress_summary();
        assert!((summary.completion_percentage - 50.0).abs() < 1e-9);
        assert_eq!(summary.subgoals_remaining, 1);
    }

    #[test]
    fn test_navigation_history_bounded() {
        let mut wm = WorkingMemory::new();
        for i in 0..30 {
            wm.record_navigation(format!("https://a.test/{}", i));
            wm.record_navigation(format!("https://a.test/{}", i));
        }
        let history: Vec<&String> = wm.navigation_history().collect();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0], "https://a.test/10");
    }

    #[test]
    fn test_prompt_section() {
        let mut wm = WorkingMemory::new();
        wm.set_goal("find lamp", "catalog");
        let goal = wm.goal().cloned().unwrap();
        wm.set_plan(plan_for(&goal));
        wm.add_failure("timeout: click('a1')");
        let s = wm.to_prompt_section();
        assert!(s.contains("## Current Goal\nfind lamp"));
        assert!(s.contains("## Active Sub-goal\nsearch"));
        assert!(s.contains("## Failures\n- timeout"));
        assert!(!s.contains("What has been tried"));
    }
}
