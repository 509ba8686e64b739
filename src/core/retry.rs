//! 自适应重试：错误分类 + 尝试次数 → 恢复策略
//!
//! 只给建议，不执行重试；同样的输入永远得到同样的策略（无随机抖动）。
//! Controller 负责等待 delay、替换目标、触发重新规划或终止，并在下一次失败时传入新的 attempt_count。

use std::time::Duration;

use serde::Serialize;

use crate::config::AppConfig;
use crate::core::ErrorKind;
use crate::react::Action;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    /// 立即重试同一动作
    Immediate,
    /// 等待 delay 后重试
    Backoff,
    /// 换一个目标元素重试
    AlternateTarget,
    /// 放弃当前子目标，交给 Planner
    Replan,
    Abort,
}

/// 一次失败对应的恢复建议
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryStrategy {
    pub strategy_type: StrategyType,
    pub delay: Duration,
    /// 尝试次数上限
    pub max_attempts: u32,
    /// AlternateTarget 时替换成的目标
    pub alternate_target: Option<String>,
    pub reason: String,
}

/// 决策所需的上下文
#[derive(Clone, Debug, Default)]
pub struct RetryContext {
    /// 目标不存在时可替换的候选（来自当前观察）
    pub alternatives: Vec<String>,
    /// 失败的原始命令；其目标不会作为替代目标
    pub action: Option<String>,
}

impl RetryContext {
    pub fn new(action: impl Into<String>, alternatives: Vec<String>) -> Self {
        Self {
            alternatives,
            action: Some(action.into()),
        }
    }

    /// 去掉与失败动作目标相同的候选
    pub fn usable_alternatives(&self) -> Vec<&str> {
        let failed = self.action.as_deref().map(Action::parse);
        let failed_target = failed.as_ref().and_then(|a| a.target());
        self.alternatives
            .iter()
            .map(String::as_str)
            .filter(|alt| !alt.trim().is_empty() && Some(alt.trim()) != failed_target)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveRetrySystem {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl AdaptiveRetrySystem {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.retry_attempts,
            Duration::from_millis(config.retry.base_delay_ms),
            Duration::from_millis(config.retry.max_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// attempt_count 从 1 开始；0 按 1 处理
    pub fn create_retry_strategy(
        &self,
        error_type: ErrorKind,
        context: &RetryContext,
        attempt_count: u32,
    ) -> RetryStrategy {
        let attempt = attempt_count.max(1);
        let strategy = |strategy_type, delay, reason: String| RetryStrategy {
            strategy_type,
            delay,
            max_attempts: self.max_attempts,
            alternate_target: None,
            reason,
        };

        if attempt >= self.max_attempts {
            return strategy(
                StrategyType::Abort,
                Duration::ZERO,
                format!("attempt {} reached the ceiling of {}", attempt, self.max_attempts),
            );
        }

        let alternatives = context.usable_alternatives();
        match error_type {
            ErrorKind::Permanent => strategy(
                StrategyType::Abort,
                Duration::ZERO,
                "error is permanent".to_string(),
            ),
            ErrorKind::TargetNotFound if !alternatives.is_empty() => {
                let idx = (attempt as usize - 1) % alternatives.len();
                let target = alternatives[idx].to_string();
                RetryStrategy {
                    alternate_target: Some(target.clone()),
                    ..strategy(
                        StrategyType::AlternateTarget,
                        Duration::ZERO,
                        format!("target missing, trying '{}'", target),
                    )
                }
            }
            ErrorKind::TargetNotFound => strategy(
                StrategyType::Replan,
                Duration::ZERO,
                "target missing and no alternative candidates".to_string(),
            ),
            ErrorKind::Timeout | ErrorKind::Transient => strategy(
                StrategyType::Backoff,
                self.backoff_delay(attempt),
                format!("{} error, backing off", error_type),
            ),
            ErrorKind::SoftFailure if attempt == 1 => strategy(
                StrategyType::Immediate,
                Duration::ZERO,
                "action had no effect, retrying once".to_string(),
            ),
            ErrorKind::SoftFailure => strategy(
                StrategyType::Replan,
                Duration::ZERO,
                "action repeatedly had no effect".to_string(),
            ),
        }
    }

    /// base × 2^(attempt−1)，上限 max_delay
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for AdaptiveRetrySystem {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system() -> AdaptiveRetrySystem {
        AdaptiveRetrySystem::new(3, Duration::from_millis(100), Duration::from_millis(350))
    }

    #[test]
    fn test_timeout_backoff_then_abort() {
        let rs = system();
        let ctx = RetryContext::default();
        let first = rs.create_retry_strategy(ErrorKind::Timeout, &ctx, 1);
        assert_eq!(first.strategy_type, StrategyType::Backoff);
        assert_eq!(first.delay, Duration::from_millis(100));
        let last = rs.create_retry_strategy(ErrorKind::Timeout, &ctx, 3);
        assert_eq!(last.strategy_type, StrategyType::Abort);
    }

    #[test]
    fn test_abort_at_ceiling_for_every_kind() {
        let rs = system();
        let ctx = RetryContext::new("click('a1')", vec!["a2".to_string()]);
        for kind in [
            ErrorKind::TargetNotFound,
            ErrorKind::Timeout,
            ErrorKind::Transient,
            ErrorKind::Permanent,
            ErrorKind::SoftFailure,
        ] {
            for attempt in 3..6 {
                assert_eq!(
                    rs.create_retry_strategy(kind, &ctx, attempt).strategy_type,
                    StrategyType::Abort
                );
            }
        }
    }

    #[test]
    fn test_backoff_non_decreasing_and_capped() {
        let rs = AdaptiveRetrySystem::new(20, Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<Duration> = (1..20)
            .map(|a| rs.create_retry_strategy(ErrorKind::Transient, &RetryContext::default(), a).delay)
            .collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(350)));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(350));
    }

    #[test]
    fn test_alternate_target_rotates() {
        let rs = AdaptiveRetrySystem::new(5, Duration::from_millis(10), Duration::from_secs(1));
        let ctx = RetryContext::new("click('a1')", vec!["b1".to_string(), "b2".to_string()]);
        let targets: Vec<Option<String>> = (1..4)
            .map(|a| rs.create_retry_strategy(ErrorKind::TargetNotFound, &ctx, a).alternate_target)
            .collect();
        assert_eq!(
            targets,
            vec![Some("b1".to_string()), Some("b2".to_string()), Some("b1".to_string())]
        );
        let none = rs.create_retry_strategy(ErrorKind::TargetNotFound, &RetryContext::default(), 1);
        assert_eq!(none.strategy_type, StrategyType::Replan);
    }

    #[test]
    fn test_alternates_skip_failing_target() {
        let rs = AdaptiveRetrySystem::new(5, Duration::from_millis(10), Duration::from_secs(1));
        let ctx = RetryContext::new(
            "click('a9')",
            vec!["a9".to_string(), "b1".to_string(), "a9".to_string(), "b2".to_string()],
        );
        assert_eq!(ctx.usable_alternatives(), vec!["b1", "b2"]);
        let targets: Vec<Option<String>> = (1..3)
            .map(|a| rs.create_retry_strategy(ErrorKind::TargetNotFound, &ctx, a).alternate_target)
            .collect();
        assert_eq!(targets, vec![Some("b1".to_string()), Some("b2".to_string())]);

        // 只剩失败目标本身时转为重新规划
        let only_self = RetryContext::new("fill('a9', 'mug')", vec!["a9".to_string()]);
        let strategy = rs.create_retry_strategy(ErrorKind::TargetNotFound, &only_self, 1);
        assert_eq!(strategy.strategy_type, StrategyType::Replan);
        assert!(strategy.alternate_target.is_none());
    }

    #[test]
    fn test_permanent_and_soft_failure() {
        let rs = system();
        let ctx = RetryContext::default();
        assert_eq!(
            rs.create_retry_strategy(ErrorKind::Permanent, &ctx, 1).strategy_type,
            StrategyType::Abort
        );
        assert_eq!(
            rs.create_retry_strategy(ErrorKind::SoftFailure, &ctx, 0).strategy_type,
            StrategyType::Immediate
        );
        assert_eq!(
            rs.create_retry_strategy(ErrorKind::SoftFailure, &ctx, 2).strategy_type,
            StrategyType::Replan
        );
    }

    #[test]
    fn test_deterministic() {
        let rs = system();
        let ctx = RetryContext::new("click('a1')", vec!["b1".to_string()]);
        assert_eq!(
            rs.create_retry_strategy(ErrorKind::TargetNotFound, &ctx, 2),
            rs.create_retry_strategy(ErrorKind::TargetNotFound, &ctx, 2)
        );
    }
}
