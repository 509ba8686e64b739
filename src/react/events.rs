//! 控制循环过程事件：供前端/日志订阅者展示每一步的观察、提议、评估与恢复

use serde::Serialize;

use crate::core::{StrategyType, TerminalStatus};
use crate::react::SubGoalStatus;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 步数更新（当前第几步）
    StepUpdate { step: usize, max_steps: usize },
    /// 当前观察的指纹
    Fingerprint { fingerprint: String },
    /// 从情景记忆召回的条数
    Recall { count: usize },
    /// 提议的动作
    Proposal { action: String, subgoal: Option<String> },
    /// 动作评估结果
    Critique {
        action: String,
        effectiveness: f64,
        confidence: f64,
    },
    /// 动作失败（适配器错误或软失败）
    ActionFailure { action: String, kind: String, reason: String },
    /// 采用的重试策略
    Retry {
        strategy: StrategyType,
        attempt: u32,
        delay_ms: u64,
    },
    /// 重新规划
    Replan { revision: u32, reason: String },
    /// 子目标状态变化
    SubGoalTransition { description: String, status: SubGoalStatus },
    /// episode 结束
    Finished { status: TerminalStatus, steps: usize },
}
