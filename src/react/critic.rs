//! Critic：动作结果自评
//!
//! 比较执行前后两个观察，给出 effectiveness（是否真的推进了任务）与 confidence（信号有多强）。
//! 预期随动作类型而定：输入类要求目标字段确实变成输入内容，导航类要求目的地改变，
//! 其余动作要求页面出现噪声以外的变化。纯函数，输入残缺时只会得到低分，不会 panic。

use std::collections::HashSet;

use serde::Serialize;

use crate::config::CritiqueSection;
use crate::memory::hasher::normalize_text;
use crate::memory::{Observation, StateHasher};
use crate::react::{Action, ActionKind};

const SUCCESS_KEYWORDS: &[&str] = &[
    "success",
    "submitted",
    "saved",
    "confirmed",
    "thank you",
    "added to cart",
    "completed",
];
const ERROR_KEYWORDS: &[&str] = &["error", "failed", "invalid", "incorrect", "not found"];

/// 满足动作预期时的基础分
const EXPECTATION_MET: f64 = 0.6;
/// 页面有变化但不符合预期
const PARTIAL_CHANGE: f64 = 0.2;

/// 一次评估结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActionCritique {
    pub effectiveness_score: f64,
    pub confidence_score: f64,
    pub rationale: String,
    pub recommendations: Vec<String>,
}

impl ActionCritique {
    /// 关闭自评时的直通结果：不判定为软失败
    pub fn neutral() -> Self {
        Self {
            effectiveness_score: 1.0,
            confidence_score: 0.5,
            rationale: "Critique disabled; action accepted as reported by the environment.".to_string(),
            recommendations: Vec::new(),
        }
    }
}

/// 执行前后的差异信号
#[derive(Debug, Default)]
struct Signals {
    identical: bool,
    changed: bool,
    url_changed: bool,
    structure_changed: bool,
    new_elements: usize,
    field_filled: bool,
    success_appeared: bool,
    error_appeared: bool,
}

#[derive(Debug, Clone)]
pub struct SelfCritiqueSystem {
    effectiveness_threshold: f64,
    hasher: StateHasher,
}

impl SelfCritiqueSystem {
    pub fn new(effectiveness_threshold: f64) -> Self {
        Self {
            effectiveness_threshold: effectiveness_threshold.clamp(0.0, 1.0),
            hasher: StateHasher::new(),
        }
    }

    pub fn from_config(config: &CritiqueSection) -> Self {
        Self::new(config.effectiveness_threshold)
    }

    pub fn effectiveness_threshold(&self) -> f64 {
        self.effectiveness_threshold
    }

    /// 分数严格高于阈值才算有效；否则是软失败
    pub fn is_effective(&self, critique: &ActionCritique) -> bool {
        critique.effectiveness_score > self.effectiveness_threshold
    }

    pub fn evaluate_action_outcome(
        &self,
        action: &Action,
        before: &Observation,
        after: &Observation,
        execution_time: f64,
    ) -> ActionCritique {
        self.evaluate(action, before, after, execution_time, None)
    }

    /// 同 evaluate_action_outcome，附带适配器报告的错误信息（写入 rationale 与建议）
    pub fn evaluate(
        &self,
        action: &Action,
        before: &Observation,
        after: &Observation,
        execution_time: f64,
        error: Option<&str>,
    ) -> ActionCritique {
        let signals = self.diff(action, before, after);
        let effectiveness = Self::effectiveness(action.kind, &signals);
        let confidence = Self::confidence(&signals, execution_time);

        tracing::debug!(
            "Critique for {}: effectiveness {:.2}, confidence {:.2} (changed: {}, success: {}, error: {})",
            action,
            effectiveness,
            confidence,
            signals.changed,
            signals.success_appeared,
            signals.error_appeared
        );

        ActionCritique {
            effectiveness_score: effectiveness,
            confidence_score: confidence,
            rationale: Self::rationale(effectiveness, confidence, &signals, error),
            recommendations: Self::recommendations(action.kind, effectiveness, confidence, error),
        }
    }

    fn diff(&self, action: &Action, before: &Observation, after: &Observation) -> Signals {
        let before_text = page_text(before);
        let after_text = page_text(after);
        let structure_changed = self.hasher.hash(before) != self.hasher.hash(after);
        let text_changed = before_text != after_text;
        if !structure_changed && !text_changed {
            return Signals {
                identical: true,
                ..Default::default()
            };
        }

        let url_changed = before.url.as_deref().map(str::trim) != after.url.as_deref().map(str::trim);
        let seen: HashSet<(String, String)> = before
            .flatten()
            .into_iter()
            .map(|(_, e)| (e.role.to_lowercase(), normalize_text(&e.name)))
            .collect();
        let new_elements = after
            .flatten()
            .into_iter()
            .filter(|(_, e)| !seen.contains(&(e.role.to_lowercase(), normalize_text(&e.name))))
            .count();

        let field_filled = match (action.target(), action.text()) {
            (Some(target), Some(text)) if !text.trim().is_empty() => after
                .find_element(target)
                .and_then(|e| e.value.as_deref())
                .map(|v| v.to_lowercase().contains(&text.trim().to_lowercase()))
                .unwrap_or(false),
            _ => false,
        };

        let appeared = |keywords: &[&str]| {
            keywords
                .iter()
                .any(|k| after_text.contains(k) && !before_text.contains(k))
        };

        Signals {
            identical: false,
            changed: true,
            url_changed,
            structure_changed,
            new_elements,
            field_filled,
            success_appeared: appeared(SUCCESS_KEYWORDS),
            error_appeared: appeared(ERROR_KEYWORDS),
        }
    }

    fn effectiveness(kind: ActionKind, s: &Signals) -> f64 {
        if s.identical {
            return 0.0;
        }
        let expectation_met = match kind {
            ActionKind::Goto => s.url_changed,
            ActionKind::Fill | ActionKind::SelectOption => s.field_filled,
            ActionKind::Noop | ActionKind::SendMessage => false,
            ActionKind::Click | ActionKind::Scroll | ActionKind::Other => s.changed,
        };
        let mut score = if expectation_met {
            EXPECTATION_MET
        } else if s.changed {
            PARTIAL_CHANGE
        } else {
            0.0
        };
        score += (s.new_elements as f64 * 0.05).min(0.2);
        if s.success_appeared {
            score += 0.4;
        }
        if s.error_appeared {
            score -= 0.3;
        }
        score.clamp(0.0, 1.0)
    }

    fn confidence(s: &Signals, execution_time: f64) -> f64 {
        if s.identical {
            return 0.2;
        }
        let strong = [
            s.url_changed,
            s.structure_changed,
            s.field_filled || s.new_elements > 0,
            s.success_appeared,
            s.error_appeared,
        ]
        .iter()
        .filter(|b| **b)
        .count();
        let mut confidence = 0.3 + 0.15 * strong as f64;
        if execution_time.is_finite() {
            if execution_time < 2.0 {
                confidence += 0.1;
            } else if execution_time > 10.0 {
                confidence -= 0.1;
            }
        }
        confidence.clamp(0.0, 1.0)
    }

    fn rationale(effectiveness: f64, confidence: f64, s: &Signals, error: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.push(
            if effectiveness > 0.7 {
                "Action was highly effective"
            } else if effectiveness > 0.4 {
                "Action was moderately effective"
            } else {
                "Action had low effectiveness"
            }
            .to_string(),
        );
        parts.push(
            if confidence > 0.7 {
                "with high confidence"
            } else if confidence > 0.4 {
                "with moderate confidence"
            } else {
                "with low confidence"
            }
            .to_string(),
        );
        if s.identical {
            parts.push("No observable change after the action".to_string());
        }
        if s.success_appeared {
            parts.push("A success indicator appeared".to_string());
        }
        if s.error_appeared {
            parts.push("An error indicator appeared".to_string());
        }
        if let Some(err) = error {
            let excerpt: String = err.chars().take(100).collect();
            parts.push(format!("Error encountered: {}", excerpt));
        }
        format!("{}.", parts.join(". "))
    }

    fn recommendations(kind: ActionKind, effectiveness: f64, confidence: f64, error: Option<&str>) -> Vec<String> {
        let mut out = Vec::new();
        if effectiveness < 0.3 {
            out.push("Consider alternative approach to achieve goal".to_string());
        }
        if confidence < 0.5 {
            out.push("Gather more context before next action".to_string());
        }
        if effectiveness < 0.5 && confidence < 0.5 {
            out.push("Consider breaking down task into smaller steps".to_string());
        }
        if let Some(err) = error.map(str::to_lowercase) {
            if err.contains("timeout") || err.contains("timed out") {
                out.push("Increase wait times for page loading".to_string());
            }
            if err.contains("not found") {
                out.push("Verify element selectors and page structure".to_string());
            }
        }
        if effectiveness < 0.5 {
            match kind {
                ActionKind::Click => {
                    out.push("Ensure element is visible and clickable before clicking".to_string())
                }
                ActionKind::Fill => {
                    out.push("Clear input field and verify it accepts text input".to_string())
                }
                _ => {}
            }
        }
        out
    }
}

impl Default for SelfCritiqueSystem {
    fn default() -> Self {
        Self::new(0.5)
    }
}

fn page_text(obs: &Observation) -> String {
    let mut s = String::new();
    if let Some(title) = &obs.title {
        s.push_str(title);
        s.push('\n');
    }
    if let Some(text) = &obs.text {
        s.push_str(text);
    }
    normalize_text(&s).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Element;

    fn search_page(value: Option<&str>) -> Observation {
        let mut field = Element::new("searchbox", "Search").with_bid("a1");
        if let Some(v) = value {
            field = field.with_value(v);
        }
        Observation::new("https://shop.test/", "Shop").with_elements(vec![field])
    }

    #[test]
    fn test_identical_states_score_zero() {
        let critic = SelfCritiqueSystem::default();
        let page = search_page(None);
        let c = critic.evaluate_action_outcome(&Action::parse("click('a1')"), &page, &page, 0.3);
        assert!(c.effectiveness_score.abs() < 1e-9);
        assert!(c.confidence_score < 0.5);
        assert!(!critic.is_effective(&c));
        assert!(c.rationale.contains("No observable change"));
    }

    #[test]
    fn test_success_indicator_scores_high() {
        let critic = SelfCritiqueSystem::default();
        let before = search_page(None);
        let after = before.clone().with_text("Order submitted. Thank you!");
        for raw in ["click('a1')", "goto('https://shop.test/')", "fill('a1', 'x')"] {
            let c = critic.evaluate_action_outcome(&Action::parse(raw), &before, &after, 1.0);
            assert!(c.effectiveness_score > 0.5, "{} scored {}", raw, c.effectiveness_score);
        }
    }

    #[test]
    fn test_fill_requires_target_field_change() {
        let critic = SelfCritiqueSystem::default();
        let before = search_page(None);
        let filled = search_page(Some("desk lamp"));
        let action = Action::parse("fill('a1', 'desk lamp')");
        let good = critic.evaluate_action_outcome(&action, &before, &filled, 0.5);
        assert!(critic.is_effective(&good));

        let other = search_page(Some("chair"));
        let bad = critic.evaluate_action_outcome(&action, &before, &other, 0.5);
        assert!(!critic.is_effective(&bad));
        assert!(bad.effectiveness_score > 0.0);
    }

    #[test]
    fn test_goto_requires_destination_change() {
        let critic = SelfCritiqueSystem::default();
        let before = search_page(None);
        let mut after = search_page(None);
        after.url = Some("https://shop.test/cart".to_string());
        let c = critic.evaluate_action_outcome(&Action::parse("goto('https://shop.test/cart')"), &before, &after, 0.5);
        assert!(critic.is_effective(&c));
    }

    #[test]
    fn test_error_indicator_lowers_score() {
        let critic = SelfCritiqueSystem::default();
        let before = search_page(None);
        let after = before.clone().with_text("Error: invalid request");
        let c = critic.evaluate(&Action::parse("click('a1')"), &before, &after, 12.0, Some("timeout waiting"));
        assert!(c.effectiveness_score < 0.5);
        assert!(c.rationale.contains("Error encountered: timeout waiting"));
        assert!(c.recommendations.iter().any(|r| r.contains("wait times")));
    }

    #[test]
    fn test_malformed_snapshots_do_not_panic() {
        let critic = SelfCritiqueSystem::default();
        let empty = Observation::default();
        let c = critic.evaluate_action_outcome(&Action::parse("???"), &empty, &search_page(None), f64::NAN);
        assert!((0.0..=1.0).contains(&c.effectiveness_score));
        assert!((0.0..=1.0).contains(&c.confidence_score));
    }
}
