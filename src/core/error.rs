//! Agent 错误类型与适配器错误分类
//!
//! AgentError 是库内部的错误（参数非法、状态迁移非法、持久化失败等）；
//! AdapterError 是环境适配器上报的动作失败，带有 ErrorKind 分类提示，交给 AdaptiveRetrySystem 决策。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 库内部错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 子目标状态只能单调推进（重新规划除外）
    #[error("Invalid sub-goal transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Proposer error: {0}")]
    ProposerError(String),
}

/// 适配器错误的分类（决定重试策略）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 目标元素不存在
    TargetNotFound,
    Timeout,
    /// 网络抖动、元素过期、限流等可恢复错误
    Transient,
    /// 不可恢复（权限、非法动作等）
    Permanent,
    /// 适配器未报错，但 Critic 判定动作无效
    SoftFailure,
}

/// 关键词分类表：按顺序匹配，第一个命中者生效
const CLASSIFICATION_RULES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Timeout, &["timeout", "timed out", "took too long"]),
    (
        ErrorKind::TargetNotFound,
        &[
            "not found",
            "no such element",
            "unable to locate",
            "cannot locate",
            "does not exist",
        ],
    ),
    (
        ErrorKind::Transient,
        &[
            "stale",
            "no longer attached",
            "network",
            "connection",
            "rate limit",
            "429",
            "too many requests",
            "not interactable",
            "intercepted",
            "page load",
        ],
    ),
    (
        ErrorKind::Permanent,
        &["permission", "forbidden", "unauthorized", "invalid action", "unsupported"],
    ),
];

impl ErrorKind {
    /// 从错误消息推断分类；无法识别的错误按 Transient 处理（给一次退避重试的机会）
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        CLASSIFICATION_RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TargetNotFound => "target_not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::SoftFailure => "soft_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 环境适配器上报的动作失败
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 适配器没有给出分类提示时，从消息文本推断
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::classify(&message),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_timeout() {
        assert_eq!(ErrorKind::classify("Navigation timed out after 30000ms"), ErrorKind::Timeout);
    }

    #[test]
    fn test_classify_not_found() {
        assert_eq!(
            ErrorKind::classify("Element 'a42' not found in page"),
            ErrorKind::TargetNotFound
        );
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(ErrorKind::classify("403 Forbidden"), ErrorKind::Permanent);
    }

    #[test]
    fn test_classify_unknown_is_transient() {
        assert_eq!(ErrorKind::classify("something odd happened"), ErrorKind::Transient);
    }

    #[test]
    fn test_adapter_error_display() {
        let err = AdapterError::new(ErrorKind::Timeout, "slow page");
        assert_eq!(err.to_string(), "timeout: slow page");
    }
}
