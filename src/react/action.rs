//! 动作命令解析
//!
//! 提议者给出字符串命令（如 `click('a12')`、`fill('a3', 'desk lamp')`、`goto('https://…')`），
//! 这里解析出动作类型与参数，供 Critic 选择预期、供重试替换目标。解析永不失败：无法识别的命令为 Other。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static CALL_RE: OnceLock<Regex> = OnceLock::new();
static ARG_RE: OnceLock<Regex> = OnceLock::new();

fn call_re() -> &'static Regex {
    CALL_RE.get_or_init(|| Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\s*;?\s*$").unwrap())
}

fn arg_re() -> &'static Regex {
    ARG_RE.get_or_init(|| {
        Regex::new(r#"'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)"|([^,\s][^,]*)"#).unwrap()
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    /// 输入文本
    Fill,
    SelectOption,
    /// 导航（goto / go_back / go_forward）
    Goto,
    Scroll,
    Noop,
    /// 给用户的终止消息
    SendMessage,
    Other,
}

impl ActionKind {
    fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "click" | "dblclick" | "double_click" => ActionKind::Click,
            "fill" | "type" | "type_text" => ActionKind::Fill,
            "select_option" | "select" => ActionKind::SelectOption,
            "goto" | "navigate" | "go_back" | "go_forward" => ActionKind::Goto,
            "scroll" => ActionKind::Scroll,
            "noop" | "wait" => ActionKind::Noop,
            "send_msg_to_user" | "report_infeasible" | "finish" => ActionKind::SendMessage,
            _ => ActionKind::Other,
        }
    }
}

/// 解析后的动作
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub raw: String,
    pub name: String,
    pub kind: ActionKind,
    pub args: Vec<String>,
}

impl Action {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let Some(caps) = call_re().captures(&raw) else {
            return Self {
                name: raw.clone(),
                raw,
                kind: ActionKind::Other,
                args: Vec::new(),
            };
        };
        let name = caps[1].to_string();
        let args = arg_re()
            .captures_iter(&caps[2])
            .filter_map(|c| {
                c.get(1)
                    .or_else(|| c.get(2))
                    .map(|m| m.as_str().replace("\\'", "'").replace("\\\"", "\""))
                    .or_else(|| c.get(3).map(|m| m.as_str().trim().to_string()))
            })
            .collect();
        Self {
            kind: ActionKind::from_name(&name),
            name,
            raw,
            args,
        }
    }

    /// 作用的元素（click / fill / select_option 的第一个参数）
    pub fn target(&self) -> Option<&str> {
        match self.kind {
            ActionKind::Click | ActionKind::Fill | ActionKind::SelectOption => {
                self.args.first().map(String::as_str)
            }
            _ => None,
        }
    }

    /// fill 的输入文本 / select_option 的选项
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            ActionKind::Fill | ActionKind::SelectOption => self.args.get(1).map(String::as_str),
            ActionKind::SendMessage => self.args.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == ActionKind::SendMessage
    }

    /// 替换目标元素，其余参数不变（用于 alternate-target 重试）
    pub fn with_target(&self, target: &str) -> Self {
        if self.target().is_none() {
            return self.clone();
        }
        let mut args = self.args.clone();
        args[0] = target.to_string();
        let rendered: Vec<String> = args
            .iter()
            .map(|a| format!("'{}'", a.replace('\'', "\\'")))
            .collect();
        Self {
            raw: format!("{}({})", self.name, rendered.join(", ")),
            name: self.name.clone(),
            kind: self.kind,
            args,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
