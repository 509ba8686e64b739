//! 动作提议者：观察 + 当前子目标 + 召回的情景 → 动作命令或终止消息
//!
//! 单一能力的 trait，实现可替换：LlmProposer（拼 prompt 调用 LLM 并解析回复）、
//! ScriptedProposer（按脚本依次给出动作，用于测试与冒烟运行）。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::memory::{Episode, Goal, Observation};
use crate::react::{Action, ActionHint, ActionKind, SubGoal};

/// 提议结果
#[derive(Clone, Debug, PartialEq)]
pub enum Proposal {
    Action(Action),
    /// 给用户的终止消息：episode 到此结束
    Terminal(String),
}

impl Proposal {
    /// 解析文本回复：去掉 ``` 代码块围栏，取第一行可识别的动作命令
    pub fn from_reply(reply: &str) -> Result<Self, AgentError> {
        let trimmed = reply.trim();
        let body = match trimmed.find("```") {
            Some(start) => {
                let rest = &trimmed[start + 3..];
                let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or(rest);
                rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
            }
            None => trimmed,
        };
        body.lines()
            .map(Action::parse)
            .find(|a| a.kind != ActionKind::Other)
            .map(Self::from_action)
            .ok_or_else(|| {
                let excerpt: String = trimmed.chars().take(120).collect();
                AgentError::ProposerError(format!("no action command in reply: {}", excerpt))
            })
    }

    pub fn from_action(action: Action) -> Self {
        if action.is_terminal() {
            Proposal::Terminal(action.text().unwrap_or_default().to_string())
        } else {
            Proposal::Action(action)
        }
    }
}

/// 一次提议所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    pub goal: &'a Goal,
    pub observation: &'a Observation,
    pub active_subgoal: Option<&'a SubGoal>,
    pub recalled: &'a [Episode],
    /// WorkingMemory 的 prompt 片段
    pub memory_section: &'a str,
    /// 记忆中该状态下表现最好的动作
    pub suggestion: Option<(&'a str, f64)>,
    /// Planner 对当前子目标给出的下一步建议
    pub hint: Option<&'a ActionHint>,
}

#[async_trait]
pub trait ActionProposer: Send + Sync {
    async fn propose(&self, request: ProposalRequest<'_>) -> Result<Proposal, AgentError>;
}

/// 按脚本依次给出动作；脚本用完后给出终止消息
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    script: Mutex<VecDeque<String>>,
}

impl ScriptedProposer {
    pub fn new<I, S>(script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(script.into_iter().map(Into::into).collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ActionProposer for ScriptedProposer {
    async fn propose(&self, _request: ProposalRequest<'_>) -> Result<Proposal, AgentError> {
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        Ok(match next {
            Some(raw) => Proposal::from_action(Action::parse(&raw)),
            None => Proposal::Terminal("script exhausted".to_string()),
        })
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You control a web browser to accomplish a goal. \
Reply with exactly one action per turn, one of: click('id'), fill('id', 'text'), \
select_option('id', 'value'), goto('url'), scroll(dx, dy), noop(), send_msg_to_user('text'). \
Use send_msg_to_user only when the goal is achieved or impossible.";

/// LLM 驱动的提议者
pub struct LlmProposer {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmProposer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 构建 user 消息：记忆片段、当前子目标、召回的经验、页面元素
    pub fn build_prompt(request: &ProposalRequest<'_>) -> String {
        let mut s = String::new();
        s.push_str(request.memory_section);
        if request.memory_section.is_empty() {
            s.push_str(&format!("## Current Goal\n{}\n\n", request.goal.description));
        }
        if let Some(sub) = request.active_subgoal {
            s.push_str(&format!(
                "## Focus\nWork on sub-goal '{}' (attempt {}).\n\n",
                sub.description,
                sub.attempts + 1
            ));
        }
        if let Some(hint) = request.hint {
            s.push_str(&format!("## Suggested next action\n{}\n\n", hint));
        }
        if let Some((action, confidence)) = request.suggestion {
            s.push_str(&format!(
                "## Suggested by memory\n{} (confidence {:.2})\n\n",
                action, confidence
            ));
        }
        if !request.recalled.is_empty() {
            s.push_str("## Similar past steps\n");
            for ep in request.recalled {
                s.push_str(&format!(
                    "- {} -> {} ({})\n",
                    ep.action,
                    ep.outcome,
                    if ep.success { "ok" } else { "failed" }
                ));
            }
            s.push('\n');
        }
        let obs = request.observation;
        s.push_str("## Page\n");
        s.push_str(&format!(
            "url: {}\ntitle: {}\n",
            obs.url.as_deref().unwrap_or("-"),
            obs.title.as_deref().unwrap_or("-")
        ));
        for (depth, e) in obs.flatten() {
            let mut line = format!("{}[{}] {} '{}'", "  ".repeat(depth), e.reference(), e.role, e.name);
            if let Some(v) = &e.value {
                line.push_str(&format!(" value='{}'", v));
            }
            s.push_str(&line);
            s.push('\n');
        }
        if let Some(text) = &obs.text {
            let excerpt: String = text.chars().take(500).collect();
            s.push_str(&format!("\n{}\n", excerpt));
        }
        s
    }
}

#[async_trait]
impl ActionProposer for LlmProposer {
    async fn propose(&self, request: ProposalRequest<'_>) -> Result<Proposal, AgentError> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(Self::build_prompt(&request)),
        ];
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| AgentError::ProposerError(e.to_string()))?;
        tracing::debug!("LLM reply: {}", reply);
        Proposal::from_reply(&reply)
    }
}
