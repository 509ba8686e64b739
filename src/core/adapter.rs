//! 环境适配器边界与动作执行器
//!
//! EnvironmentAdapter：execute(action) → (新观察, 可选错误)，错误带分类提示。
//! ActionExecutor 对每次调用施加超时，超时转为 ErrorKind::Timeout；每次调用输出结构化审计日志（JSON）。
//! ScriptedEnvironment 按脚本回放观察与错误，用于测试与冒烟运行。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::timeout;

use crate::core::{AdapterError, ErrorKind};
use crate::memory::Observation;
use crate::react::Action;

/// 一次动作执行的结果
#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub observation: Observation,
    pub error: Option<AdapterError>,
}

impl StepResult {
    pub fn ok(observation: Observation) -> Self {
        Self {
            observation,
            error: None,
        }
    }

    pub fn failed(observation: Observation, error: AdapterError) -> Self {
        Self {
            observation,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait EnvironmentAdapter: Send + Sync {
    async fn execute(&self, action: &Action) -> StepResult;
}

/// 动作执行器：超时 + 审计日志
pub struct ActionExecutor {
    adapter: Arc<dyn EnvironmentAdapter>,
    timeout: Duration,
}

impl ActionExecutor {
    pub fn new(adapter: Arc<dyn EnvironmentAdapter>, timeout_ms: u64) -> Self {
        Self {
            adapter,
            timeout: Duration::from_millis(timeout_ms.max(1)),
        }
    }

    /// 执行动作；超时时沿用上一个观察并报告 Timeout。返回结果与耗时
    pub async fn execute(&self, action: &Action, current: &Observation) -> (StepResult, Duration) {
        let start = Instant::now();
        let result = match timeout(self.timeout, self.adapter.execute(action)).await {
            Ok(r) => r,
            Err(_) => StepResult::failed(
                current.clone(),
                AdapterError::new(
                    ErrorKind::Timeout,
                    format!("action timed out after {}ms", self.timeout.as_millis()),
                ),
            ),
        };
        let elapsed = start.elapsed();

        let outcome = result
            .error
            .as_ref()
            .map(|e| e.kind.as_str())
            .unwrap_or("ok");
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": action.raw,
            "ok": result.error.is_none(),
            "outcome": outcome,
            "duration_ms": elapsed.as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "action");

        (result, elapsed)
    }
}

/// 脚本中的一步：新观察（缺省沿用当前观察）、可选错误、可选人为延迟
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ScriptedStep {
    #[serde(default)]
    pub observation: Option<Observation>,
    #[serde(default)]
    pub error: Option<String>,
    /// 错误分类提示；缺省时从错误消息推断
    #[serde(default)]
    pub kind: Option<ErrorKind>,
    #[serde(default)]
    pub delay_ms: u64,
}

impl ScriptedStep {
    pub fn observe(observation: Observation) -> Self {
        Self {
            observation: Some(observation),
            ..Default::default()
        }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

#[derive(Debug)]
struct ScriptState {
    current: Observation,
    steps: VecDeque<ScriptedStep>,
    executed: Vec<String>,
}

/// 按脚本回放的环境；脚本用完后每个动作都返回当前观察、无错误
#[derive(Debug)]
pub struct ScriptedEnvironment {
    state: Mutex<ScriptState>,
}

impl ScriptedEnvironment {
    pub fn new(initial: Observation, steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                current: initial,
                steps: steps.into_iter().collect(),
                executed: Vec::new(),
            }),
        }
    }

    /// 已执行过的动作（原始命令）
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn current(&self) -> Observation {
        self.lock().current.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EnvironmentAdapter for ScriptedEnvironment {
    async fn execute(&self, action: &Action) -> StepResult {
        let step = {
            let mut state = self.lock();
            state.executed.push(action.raw.clone());
            state.steps.pop_front().unwrap_or_default()
        };
        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
        let mut state = self.lock();
        if let Some(obs) = step.observation {
            state.current = obs;
        }
        let observation = state.current.clone();
        match step.error {
            Some(message) => {
                let error = match step.kind {
                    Some(kind) => AdapterError::new(kind, message),
                    None => AdapterError::from_message(message),
                };
                StepResult::failed(observation, error)
            }
            None => StepResult::ok(observation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_environment_replays() {
        let start = Observation::new("https://a.test/", "A");
        let next = Observation::new("https://a.test/b", "B");
        let env = ScriptedEnvironment::new(
            start.clone(),
            vec![
                ScriptedStep::observe(next.clone()),
                ScriptedStep::fail(ErrorKind::TargetNotFound, "no such element a9"),
            ],
        );
        let r1 = env.execute(&Action::parse("click('a1')")).await;
        assert_eq!(r1, StepResult::ok(next.clone()));
        let r2 = env.execute(&Action::parse("click('a9')")).await;
        assert_eq!(r2.observation, next);
        assert_eq!(r2.error.map(|e| e.kind), Some(ErrorKind::TargetNotFound));
        let r3 = env.execute(&Action::parse("noop()")).await;
        assert!(r3.error.is_none());
        assert_eq!(env.executed(), vec!["click('a1')", "click('a9')", "noop()"]);
    }

    #[tokio::test]
    async fn test_executor_times_out() {
        let start = Observation::new("https://a.test/", "A");
        let env = Arc::new(ScriptedEnvironment::new(
            start.clone(),
            vec![ScriptedStep::observe(Observation::new("https://a.test/late", "Late")).with_delay(200)],
        ));
        let executor = ActionExecutor::new(env, 20);
        let (result, _) = executor.execute(&Action::parse("click('a1')"), &start).await;
        assert_eq!(result.observation, start);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_scripted_step_deserializes() {
        let step: ScriptedStep =
            serde_json::from_value(serde_json::json!({ "error": "Request timed out" })).unwrap();
        assert!(step.observation.is_none());
        assert_eq!(step.kind, None);
        assert_eq!(step.delay_ms, 0);
    }
}
