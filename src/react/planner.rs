//! Planner：目标分解与重新规划
//!
//! 按关键词与领域匹配任务模板库，实例化为有序子目标（priority 按模板顺序）；
//! 无匹配时退回单个兜底子目标（即目标本身）。规划是确定性的：同一输入得到同一计划。
//! PlanMonitor 负责 `planning → executing → {completed, stalled, replanning}` 状态机与停滞检测。

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{Element, Fingerprint, Goal, Observation};
use crate::react::{ActionKind, ActionPlan, Intent, PlanStatus, SubGoal, SubGoalStatus};

/// 兜底模板名
pub const CATCH_ALL_TEMPLATE: &str = "catch_all";

/// 任务模板：(描述, 意图, 预估步数)
struct TaskTemplate {
    name: &'static str,
    keywords: &'static [&'static str],
    domains: &'static [&'static str],
    subgoals: &'static [(&'static str, Intent, u32)],
}

const TEMPLATES: &[TaskTemplate] = &[
    TaskTemplate {
        name: "search_select",
        keywords: &["find", "search", "locate", "look", "select", "item", "pick"],
        domains: &["catalog", "shop", "shopping", "store"],
        subgoals: &[
            ("search", Intent::Search, 3),
            ("inspect-results", Intent::Inspect, 2),
            ("select-item", Intent::Select, 2),
        ],
    },
    TaskTemplate {
        name: "ecommerce_purchase",
        keywords: &["buy", "purchase", "order", "cart", "checkout"],
        domains: &["shop", "shopping", "store", "ecommerce", "catalog"],
        subgoals: &[
            ("search-product", Intent::Search, 3),
            ("select-product", Intent::Select, 2),
            ("add-to-cart", Intent::Submit, 2),
            ("proceed-to-checkout", Intent::Navigate, 2),
            ("complete-purchase", Intent::Submit, 4),
        ],
    },
    TaskTemplate {
        name: "calendar_schedule_meeting",
        keywords: &["schedule", "meeting", "appointment", "calendar", "event"],
        domains: &["calendar"],
        subgoals: &[
            ("navigate-to-calendar", Intent::Navigate, 2),
            ("select-date-time", Intent::Select, 4),
            ("create-event-form", Intent::Submit, 3),
            ("fill-event-details", Intent::Input, 5),
            ("save-event", Intent::Submit, 2),
        ],
    },
    TaskTemplate {
        name: "email_compose_send",
        keywords: &["email", "mail", "compose", "send", "reply"],
        domains: &["mail", "email", "inbox"],
        subgoals: &[
            ("navigate-to-compose", Intent::Navigate, 2),
            ("enter-recipient", Intent::Input, 2),
            ("enter-subject", Intent::Input, 2),
            ("compose-message", Intent::Input, 3),
            ("send-email", Intent::Submit, 2),
        ],
    },
    TaskTemplate {
        name: "social_connect_message",
        keywords: &["connect", "friend", "follow", "network", "profile"],
        domains: &["social", "network"],
        subgoals: &[
            ("search-for-person", Intent::Search, 3),
            ("view-profile", Intent::Inspect, 2),
            ("initiate-connection", Intent::Submit, 2),
            ("send-message", Intent::Input, 3),
        ],
    },
    TaskTemplate {
        name: "restaurant_reservation",
        keywords: &["restaurant", "reservation", "reserve", "dining", "table"],
        domains: &["dining", "restaurant", "food"],
        subgoals: &[
            ("search-restaurants", Intent::Search, 3),
            ("select-restaurant", Intent::Select, 2),
            ("choose-date-time", Intent::Select, 3),
            ("enter-party-details", Intent::Input, 3),
            ("confirm-reservation", Intent::Submit, 2),
        ],
    },
    TaskTemplate {
        name: "transportation_booking",
        keywords: &["ride", "taxi", "transport", "trip", "pickup"],
        domains: &["rides", "transport", "travel"],
        subgoals: &[
            ("enter-pickup-location", Intent::Input, 2),
            ("enter-destination", Intent::Input, 2),
            ("select-ride-type", Intent::Select, 2),
            ("confirm-booking", Intent::Submit, 2),
        ],
    },
    TaskTemplate {
        name: "form_submit",
        keywords: &["form", "fill", "register", "signup", "submit", "apply"],
        domains: &["forms"],
        subgoals: &[("fill-fields", Intent::Input, 4), ("submit-form", Intent::Submit, 2)],
    },
];

/// 规划指标落盘文件名（位于 persistence_dir 下）
const METRICS_FILE: &str = "planning_metrics.json";

/// 备选目标最多给出几个
const MAX_FALLBACKS: usize = 2;

/// 规划指标
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerMetrics {
    pub total_plans_created: u64,
    pub successful_plans: u64,
    pub failed_plans: u64,
    pub replanning_events: u64,
    /// 按失败类别计数（timeout_error / element_not_found / ...）
    pub failure_patterns: BTreeMap<String, u64>,
}

/// 子目标的下一步动作建议：首选目标、预期结果与备选目标
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionHint {
    pub action_type: ActionKind,
    /// 元素引用（bid 或名称）
    pub target: String,
    pub expected_outcome: String,
    pub confidence: f64,
    pub fallbacks: Vec<String>,
}

impl fmt::Display for ActionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action_type {
            ActionKind::Fill => "fill",
            ActionKind::SelectOption => "select_option",
            _ => "click",
        };
        write!(
            f,
            "{} '{}', expecting {} (confidence {:.2})",
            verb, self.target, self.expected_outcome, self.confidence
        )?;
        if !self.fallbacks.is_empty() {
            write!(f, "; fallbacks: {}", self.fallbacks.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct HierarchicalPlanner {
    metrics: PlannerMetrics,
    /// 设置后每次指标变化都写回 planning_metrics.json
    persistence_dir: Option<PathBuf>,
}

impl HierarchicalPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从目录加载已有的规划指标（不存在时从零开始），之后的变化都会落盘
    pub fn with_persistence(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(METRICS_FILE);
        let metrics = if path.exists() {
            match serde_json::from_str::<PlannerMetrics>(&std::fs::read_to_string(&path)?) {
                Ok(m) => {
                    tracing::info!("Loaded planning metrics ({} plans) from {}", m.total_plans_created, path.display());
                    m
                }
                Err(e) => {
                    tracing::warn!("Ignoring unreadable planning metrics at {}: {}", path.display(), e);
                    PlannerMetrics::default()
                }
            }
        } else {
            PlannerMetrics::default()
        };
        Ok(Self {
            metrics,
            persistence_dir: Some(dir),
        })
    }

    pub fn metrics(&self) -> &PlannerMetrics {
        &self.metrics
    }

    /// 写临时文件并 fsync 后 rename 覆盖；未配置目录时什么都不做
    pub fn save_metrics(&self) -> Result<(), AgentError> {
        let Some(dir) = &self.persistence_dir else {
            return Ok(());
        };
        // 并行 episode 共用目录，临时文件名各不相同
        let tmp = dir.join(format!("{}.{}.tmp", METRICS_FILE, uuid::Uuid::new_v4().simple()));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&self.metrics)?.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(METRICS_FILE))?;
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save_metrics() {
            tracing::warn!("Failed to save planning metrics: {}", e);
        }
    }

    /// 目标 + 领域 + 当前状态 → 有序子目标计划。空状态可用；确定性。
    pub fn create_plan(&mut self, goal_description: &str, domain: &str, current_state: &Observation) -> ActionPlan {
        let goal = Goal::new(goal_description, domain);
        let (template, mut subgoals) = match Self::match_template(goal_description, domain) {
            Some(t) => (
                t.name,
                t.subgoals
                    .iter()
                    .enumerate()
                    .map(|(i, (desc, intent, steps))| {
                        let mut g = SubGoal::new(*desc, domain, i as u32 + 1, *intent);
                        g.estimated_steps = *steps;
                        g
                    })
                    .collect::<Vec<_>>(),
            ),
            None => (
                CATCH_ALL_TEMPLATE,
                vec![SubGoal::new(goal_description, domain, 1, Intent::Any)],
            ),
        };
        Self::customize(&mut subgoals, current_state);

        self.metrics.total_plans_created += 1;
        self.persist();
        let plan = ActionPlan::new(goal, template, subgoals);
        tracing::info!(
            "Created plan '{}' with {} sub-goals for goal: {}",
            plan.template,
            plan.subgoals.len(),
            goal_description
        );
        plan
    }

    /// 单个兜底子目标的计划（规划关闭时使用）
    pub fn flat_plan(goal_description: &str, domain: &str) -> ActionPlan {
        ActionPlan::new(
            Goal::new(goal_description, domain),
            CATCH_ALL_TEMPLATE,
            vec![SubGoal::new(goal_description, domain, 1, Intent::Any)],
        )
    }

    /// 重新规划：当前子目标记为 failed（后面还有子目标时改为 skipped 并继续），
    /// 若它是最后一个则追加一个同意图的恢复子目标。返回新计划（revision + 1），原计划不变。
    pub fn replan(&mut self, plan: &ActionPlan, current_state: &Observation, reason: &str) -> ActionPlan {
        let mut next = plan.clone();
        next.revision = plan.revision + 1;

        if let Some(idx) = next.activate_next() {
            let failed = next.subgoals[idx].clone();
            let is_last = idx + 1 == next.subgoals.len();
            let class = classify_failure(&failed.description, Some(reason));
            *self.metrics.failure_patterns.entry(class.to_string()).or_insert(0) += 1;

            if is_last {
                next.subgoals[idx].status = SubGoalStatus::Failed;
                let mut recovery = SubGoal::new(
                    format!("retry-{}", failed.description.trim_start_matches("retry-")),
                    &failed.domain,
                    failed.priority + 1,
                    failed.intent,
                )
                .recovering(idx);
                recovery.estimated_steps = failed.estimated_steps;
                Self::customize(std::slice::from_mut(&mut recovery), current_state);
                next.subgoals.push(recovery);
            } else {
                next.subgoals[idx].status = SubGoalStatus::Skipped;
            }
            tracing::info!(
                "Replanned (revision {}): sub-goal '{}' {} after {} attempts ({})",
                next.revision,
                failed.description,
                if is_last { "failed, recovery appended" } else { "skipped" },
                failed.attempts,
                class
            );
        }

        next.activate_next();
        self.metrics.replanning_events += 1;
        self.persist();
        next
    }

    /// 为子目标挑选下一步动作：按意图筛选可交互元素，名称与子目标描述重合的优先。
    /// 兜底子目标（Intent::Any）或页面上没有合适元素时返回 None。
    pub fn next_action_hint(subgoal: &SubGoal, state: &Observation) -> Option<ActionHint> {
        let (action_type, expected_outcome): (ActionKind, &str) = match subgoal.intent {
            Intent::Search => (ActionKind::Fill, "search results listed"),
            Intent::Input => (ActionKind::Fill, "field filled"),
            Intent::Inspect => (ActionKind::Click, "details shown"),
            Intent::Select => (ActionKind::Click, "item selected"),
            Intent::Navigate => (ActionKind::Click, "page changed"),
            Intent::Submit => (ActionKind::Click, "form submitted"),
            Intent::Any => return None,
        };
        let words: Vec<String> = subgoal
            .description
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2 && *w != "retry")
            .map(str::to_string)
            .collect();

        let mut candidates: Vec<(usize, &Element)> = state
            .flatten()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| Self::fits_intent(subgoal.intent, e))
            .map(|e| {
                let name = e.name.to_lowercase();
                let mut score = words.iter().filter(|w| name.contains(w.as_str())).count();
                if subgoal.intent == Intent::Search && e.role.eq_ignore_ascii_case("searchbox") {
                    score += 1;
                }
                (score, e)
            })
            .collect();
        // 稳定排序：同分保持页面顺序
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let (score, best) = candidates.first()?;
        let action_type = match action_type {
            ActionKind::Click if best.role.eq_ignore_ascii_case("combobox") => ActionKind::SelectOption,
            other => other,
        };
        let mut confidence: f64 = 0.4;
        if *score > 0 {
            confidence += 0.4;
        }
        if matches!(action_type, ActionKind::Click | ActionKind::Fill) {
            confidence += 0.1;
        }
        if state.url.is_some() {
            confidence += 0.1;
        }
        let hint = ActionHint {
            action_type,
            target: best.reference().to_string(),
            expected_outcome: expected_outcome.to_string(),
            confidence: confidence.min(1.0),
            fallbacks: candidates
                .iter()
                .skip(1)
                .map(|(_, e)| e.reference().to_string())
                .filter(|r| !r.is_empty())
                .take(MAX_FALLBACKS)
                .collect(),
        };
        tracing::debug!("Action hint for '{}': {}", subgoal.description, hint);
        Some(hint)
    }

    fn fits_intent(intent: Intent, e: &Element) -> bool {
        let role = e.role.to_lowercase();
        match intent {
            Intent::Search | Intent::Input => e.is_input(),
            Intent::Inspect => role == "link",
            Intent::Select => matches!(role.as_str(), "link" | "option" | "checkbox" | "radio" | "combobox"),
            Intent::Navigate => matches!(role.as_str(), "link" | "menuitem" | "tab"),
            Intent::Submit => role == "button",
            Intent::Any => false,
        }
    }

    /// 记录一个计划的最终结果
    pub fn record_plan_result(&mut self, status: PlanStatus) {
        match status {
            PlanStatus::Completed => self.metrics.successful_plans += 1,
            PlanStatus::Failed | PlanStatus::Executing => self.metrics.failed_plans += 1,
        }
        self.persist();
    }

    fn match_template(goal_description: &str, domain: &str) -> Option<&'static TaskTemplate> {
        let words: Vec<String> = goal_description
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        let domain = domain.trim().to_lowercase();

        let mut best: Option<(usize, &TaskTemplate)> = None;
        for t in TEMPLATES {
            let hits = t
                .keywords
                .iter()
                .filter(|kw| words.iter().any(|w| w.starts_with(**kw)))
                .count();
            if hits == 0 {
                continue;
            }
            let score = hits + usize::from(t.domains.contains(&domain.as_str()));
            // 分数相同保留库中靠前的模板
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, t));
            }
        }
        best.map(|(_, t)| t)
    }

    /// 按页面复杂度调整未结束子目标的预估步数
    fn customize(subgoals: &mut [SubGoal], state: &Observation) {
        let count = state.element_count();
        for g in subgoals.iter_mut().filter(|g| g.status == SubGoalStatus::Pending) {
            if count > 20 {
                g.estimated_steps += 2;
            } else if count < 5 {
                g.estimated_steps = g.estimated_steps.saturating_sub(1).max(1);
            }
        }
    }
}

/// 失败归类（用于规划指标）
pub fn classify_failure(subgoal_description: &str, error_message: Option<&str>) -> &'static str {
    if let Some(msg) = error_message {
        let lower = msg.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            return "timeout_error";
        }
        if lower.contains("not found") || lower.contains("no such element") {
            return "element_not_found";
        }
        if lower.contains("click") {
            return "click_failure";
        }
        if lower.contains("fill") || lower.contains("type") || lower.contains("input") {
            return "input_failure";
        }
    }
    let desc = subgoal_description.to_lowercase();
    if desc.contains("navigate") {
        "navigation_failure"
    } else if desc.contains("search") {
        "search_failure"
    } else if desc.contains("fill") || desc.contains("enter") {
        "form_failure"
    } else {
        "unknown_failure"
    }
}

/// 计划执行状态机的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    Planning,
    Executing,
    Stalled,
    Replanning,
    Completed,
    /// 重新规划次数耗尽
    Abandoned,
}

impl PlanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanPhase::Completed | PlanPhase::Abandoned)
    }
}

/// 停滞检测与重新规划预算
#[derive(Debug, Clone)]
pub struct PlanMonitor {
    stall_threshold: usize,
    max_subgoal_attempts: u32,
    max_replans: u32,
    recent: VecDeque<Fingerprint>,
    replans: u32,
    phase: PlanPhase,
}

impl PlanMonitor {
    pub fn new(stall_threshold: usize, max_subgoal_attempts: u32, max_replans: u32) -> Self {
        Self {
            stall_threshold: stall_threshold.max(1),
            max_subgoal_attempts,
            max_replans,
            recent: VecDeque::new(),
            replans: 0,
            phase: PlanPhase::Planning,
        }
    }

    pub fn phase(&self) -> PlanPhase {
        self.phase
    }

    pub fn replans(&self) -> u32 {
        self.replans
    }

    /// 计划已创建：planning → executing
    pub fn plan_created(&mut self) {
        self.recent.clear();
        self.replans = 0;
        self.phase = PlanPhase::Executing;
    }

    /// 记录一步之后的指纹与当前子目标的尝试次数；满足条件时 executing → stalled
    pub fn observe(&mut self, fingerprint: &Fingerprint, active_attempts: u32) -> PlanPhase {
        self.recent.push_back(fingerprint.clone());
        while self.recent.len() > self.stall_threshold {
            self.recent.pop_front();
        }
        if self.phase == PlanPhase::Executing {
            let looping = self.recent.len() == self.stall_threshold
                && self.recent.iter().all(|f| f == fingerprint);
            let exhausted = active_attempts > self.max_subgoal_attempts;
            if looping || exhausted {
                tracing::info!(
                    "Plan stalled (repeated state: {}, attempts: {})",
                    looping,
                    active_attempts
                );
                self.phase = PlanPhase::Stalled;
            }
        }
        self.phase
    }

    /// 外部要求重新规划（如重试策略给出 re-plan）
    pub fn mark_stalled(&mut self) {
        if self.phase == PlanPhase::Executing {
            self.phase = PlanPhase::Stalled;
        }
    }

    /// stalled → replanning；预算耗尽时 → abandoned 并返回 false
    pub fn begin_replan(&mut self) -> bool {
        if self.replans >= self.max_replans {
            tracing::warn!("Replan budget exhausted after {} replans", self.replans);
            self.phase = PlanPhase::Abandoned;
            return false;
        }
        self.replans += 1;
        self.phase = PlanPhase::Replanning;
        true
    }

    /// replanning → executing；历史清空，新计划重新计数
    pub fn replanned(&mut self) {
        self.recent.clear();
        self.phase = PlanPhase::Executing;
    }

    /// 子目标有进展：清空指纹历史
    pub fn progressed(&mut self) {
        self.recent.clear();
    }

    pub fn complete(&mut self) {
        self.phase = PlanPhase::Completed;
    }

    pub fn abandon(&mut self) {
        self.phase = PlanPhase::Abandoned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_page() -> Observation {
        Observation::new("https://shop.test/", "Shop")
            .with_elements(vec![Element::new("searchbox", "Search").with_bid("a1")])
    }

    #[test]
    fn test_catalog_goal_uses_search_select_template() {
        let mut planner = HierarchicalPlanner::new();
        let plan = planner.create_plan("locate and select item X", "catalog", &search_page());
        assert_eq!(plan.template, "search_select");
        assert_eq!(plan.descriptions(), vec!["search", "inspect-results", "select-item"]);
        let priorities: Vec<u32> = plan.subgoals.iter().map(|g| g.priority).collect();
        assert_eq!(priorities, vec![1, 2, 3]);
        assert_eq!(plan.active().map(|g| g.description.as_str()), Some("search"));
    }

    #[test]
    fn test_planning_is_deterministic() {
        let mut p1 = HierarchicalPlanner::new();
        let mut p2 = HierarchicalPlanner::new();
        let a = p1.create_plan("buy a desk lamp", "shop", &search_page());
        let b = p2.create_plan("buy a desk lamp", "shop", &search_page());
        assert_eq!(a, b);
        assert_eq!(a.template, "ecommerce_purchase");
    }

    #[test]
    fn test_no_match_yields_catch_all() {
        let mut planner = HierarchicalPlanner::new();
        let plan = planner.create_plan("ponder the void", "misc", &Observation::default());
        assert_eq!(plan.template, CATCH_ALL_TEMPLATE);
        assert_eq!(plan.descriptions(), vec!["ponder the void"]);
        assert_eq!(plan.subgoals[0].intent, Intent::Any);
    }

    #[test]
    fn test_estimated_steps_follow_page_complexity() {
        let mut planner = HierarchicalPlanner::new();
        let simple = planner.create_plan("locate item", "catalog", &Observation::default());
        assert_eq!(simple.subgoals[0].estimated_steps, 2);
        let busy = Observation::default()
            .with_elements((0..25).map(|i| Element::new("link", format!("l{}", i))).collect());
        let complex = planner.create_plan("locate item", "catalog", &busy);
        assert_eq!(complex.subgoals[0].estimated_steps, 5);
    }

    #[test]
    fn test_replan_skips_middle_subgoal() {
        let mut planner = HierarchicalPlanner::new();
        let plan = planner.create_plan("locate and select item X", "catalog", &search_page());
        let next = planner.replan(&plan, &search_page(), "timeout waiting for results");
        assert_eq!(next.revision, 1);
        assert_eq!(next.subgoals[0].status, SubGoalStatus::Skipped);
        assert_eq!(next.active().map(|g| g.description.as_str()), Some("inspect-results"));
        assert_eq!(plan.subgoals[0].status, SubGoalStatus::Active);
        assert_eq!(planner.metrics().replanning_events, 1);
        assert_eq!(planner.metrics().failure_patterns.get("timeout_error"), Some(&1));
    }

    #[test]
    fn test_replan_last_subgoal_appends_recovery() {
        let mut planner = HierarchicalPlanner::new();
        let plan = planner.create_plan("ponder the void", "misc", &Observation::default());
        let next = planner.replan(&plan, &Observation::default(), "stuck");
        assert_eq!(next.subgoals.len(), 2);
        assert_eq!(next.subgoals[0].status, SubGoalStatus::Failed);
        assert_eq!(next.subgoals[1].description, "retry-ponder the void");
        assert_eq!(next.subgoals[1].recovers, Some(0));
        assert_eq!(next.status(), PlanStatus::Executing);
        let again = planner.replan(&next, &Observation::default(), "stuck");
        assert_eq!(again.subgoals[2].description, "retry-ponder the void");
        assert_eq!(again.subgoals[2].recovers, Some(1));

        let mut finished = again.clone();
        finished.finish_active(SubGoalStatus::Done).unwrap();
        assert_eq!(finished.status(), PlanStatus::Completed);
        assert_eq!(finished.progress(), (3, 3));
    }

    #[test]
    fn test_next_action_hint_prefers_named_target() {
        let state = Observation::new("https://shop.test/item/1", "Blue Mug").with_elements(vec![
            Element::new("button", "Share").with_bid("b0"),
            Element::new("button", "Add to cart").with_bid("b1"),
            Element::new("button", "Wishlist").with_bid("b2"),
            Element::new("link", "Home").with_bid("l1"),
        ]);
        let goal = SubGoal::new("add-to-cart", "shop", 3, Intent::Submit);
        let hint = HierarchicalPlanner::next_action_hint(&goal, &state).unwrap();
        assert_eq!(hint.action_type, ActionKind::Click);
        assert_eq!(hint.target, "b1");
        assert_eq!(hint.expected_outcome, "form submitted");
        assert!((hint.confidence - 1.0).abs() < 1e-9);
        assert_eq!(hint.fallbacks, vec!["b0", "b2"]);
        assert!(hint.to_string().starts_with("click 'b1'"));
    }

    #[test]
    fn test_next_action_hint_by_intent() {
        let state = Observation::new("https://shop.test/", "Shop").with_elements(vec![
            Element::new("button", "Go").with_bid("a2"),
            Element::new("searchbox", "Query").with_bid("a1"),
            Element::new("link", "Blue Mug").with_bid("r1"),
        ]);
        let search = SubGoal::new("search", "catalog", 1, Intent::Search);
        let hint = HierarchicalPlanner::next_action_hint(&search, &state).unwrap();
        assert_eq!(hint.action_type, ActionKind::Fill);
        assert_eq!(hint.target, "a1");

        let inspect = SubGoal::new("inspect-results", "catalog", 2, Intent::Inspect);
        let hint = HierarchicalPlanner::next_action_hint(&inspect, &state).unwrap();
        assert_eq!(hint.target, "r1");
        assert!((hint.confidence - 0.6).abs() < 1e-9);
        assert!(hint.fallbacks.is_empty());

        let any = SubGoal::new("ponder", "misc", 1, Intent::Any);
        assert!(HierarchicalPlanner::next_action_hint(&any, &state).is_none());
        let input = SubGoal::new("enter-subject", "mail", 1, Intent::Input);
        assert!(HierarchicalPlanner::next_action_hint(&input, &Observation::default()).is_none());
    }

    #[test]
    fn test_metrics_persist_across_planners() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut planner = HierarchicalPlanner::with_persistence(dir.path()).unwrap();
            let plan = planner.create_plan("find a blue mug", "catalog", &Observation::default());
            planner.replan(&plan, &Observation::default(), "Request timed out");
            planner.record_plan_result(PlanStatus::Failed);
        }
        assert!(dir.path().join(METRICS_FILE).exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let reloaded = HierarchicalPlanner::with_persistence(dir.path()).unwrap();
        let m = reloaded.metrics();
        assert_eq!(m.total_plans_created, 1);
        assert_eq!(m.replanning_events, 1);
        assert_eq!(m.failed_plans, 1);
        assert_eq!(m.failure_patterns.get("timeout_error"), Some(&1));
    }

    #[test]
    fn test_unreadable_metrics_start_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METRICS_FILE), "{not json").unwrap();
        let planner = HierarchicalPlanner::with_persistence(dir.path()).unwrap();
        assert_eq!(planner.metrics(), &PlannerMetrics::default());
    }

    #[test]
    fn test_monitor_stalls_after_threshold() {
        let mut m = PlanMonitor::new(3, 10, 2);
        m.plan_created();
        let fp = Fingerprint::from("aaaa");
        assert_eq!(m.observe(&fp, 1), PlanPhase::Executing);
        assert_eq!(m.observe(&fp, 2), PlanPhase::Executing);
        assert_eq!(m.observe(&fp, 3), PlanPhase::Stalled);
        assert!(m.begin_replan());
        assert_eq!(m.phase(), PlanPhase::Replanning);
        m.replanned();
        assert_eq!(m.observe(&fp, 0), PlanPhase::Executing);
    }

    #[test]
    fn test_monitor_attempt_ceiling_and_budget() {
        let mut m = PlanMonitor::new(3, 2, 1);
        m.plan_created();
        assert_eq!(m.observe(&Fingerprint::from("a"), 3), PlanPhase::Stalled);
        assert!(m.begin_replan());
        m.replanned();
        m.mark_stalled();
        assert!(!m.begin_replan());
        assert_eq!(m.phase(), PlanPhase::Abandoned);
        assert!(m.phase().is_terminal());
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("search", Some("Element not found")), "element_not_found");
        assert_eq!(classify_failure("navigate-to-calendar", None), "navigation_failure");
        assert_eq!(classify_failure("enter-recipient", Some("boom")), "form_failure");
    }
}
