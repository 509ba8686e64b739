//! 观察：环境适配器返回的页面状态
//!
//! 包含目的地标识（url）、标题、可交互元素树、可选的渲染文本/截图。
//! 所有字段都可缺失；缺失字段由下游（StateHasher / Critic）当作「无信号」处理。

use serde::{Deserialize, Serialize};

/// 可交互元素树的一个节点（无障碍树风格）
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    /// 浏览器分配的临时 id（如 "a42"），每次渲染都可能变化，不参与指纹
    #[serde(default)]
    pub bid: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    /// 输入框当前内容
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_bid(mut self, bid: impl Into<String>) -> Self {
        self.bid = Some(bid.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Element>) -> Self {
        self.children = children;
        self
    }

    /// 按 bid 或名称（忽略大小写）匹配动作目标
    pub fn matches_target(&self, target: &str) -> bool {
        let target = target.trim();
        if target.is_empty() {
            return false;
        }
        self.bid.as_deref() == Some(target) || self.name.trim().eq_ignore_ascii_case(target)
    }

    /// 供动作引用的标识：优先 bid，否则用名称
    pub fn reference(&self) -> &str {
        self.bid.as_deref().unwrap_or(&self.name)
    }

    pub fn is_input(&self) -> bool {
        matches!(
            self.role.to_lowercase().as_str(),
            "textbox" | "searchbox" | "combobox" | "input" | "textarea"
        )
    }

    pub fn is_interactive(&self) -> bool {
        self.is_input()
            || matches!(
                self.role.to_lowercase().as_str(),
                "button" | "link" | "checkbox" | "radio" | "option" | "menuitem" | "tab"
            )
    }
}

/// 一次观察
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub elements: Vec<Element>,
    /// 页面渲染文本（成功/错误提示等从这里识别）
    #[serde(default)]
    pub text: Option<String>,
    /// base64 截图，仅透传给提议者
    #[serde(default)]
    pub screenshot: Option<String>,
}

impl Observation {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_elements(mut self, elements: Vec<Element>) -> Self {
        self.elements = elements;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// 从任意 JSON 映射宽松地构造观察：字段缺失或类型不对时置空，不报错
    pub fn from_value(value: &serde_json::Value) -> Self {
        let str_field = |key: &str| value.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let elements = value
            .get("elements")
            .or_else(|| value.get("axtree"))
            .and_then(|v| serde_json::from_value::<Vec<Element>>(v.clone()).ok())
            .unwrap_or_default();
        Self {
            url: str_field("url"),
            title: str_field("title"),
            elements,
            text: str_field("text"),
            screenshot: str_field("screenshot"),
        }
    }

    /// 深度优先展开元素树：(深度, 元素)
    pub fn flatten(&self) -> Vec<(usize, &Element)> {
        fn walk<'a>(elements: &'a [Element], depth: usize, out: &mut Vec<(usize, &'a Element)>) {
            for e in elements {
                out.push((depth, e));
                walk(&e.children, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.elements, 0, &mut out);
        out
    }

    pub fn element_count(&self) -> usize {
        self.flatten().len()
    }

    pub fn find_element(&self, target: &str) -> Option<&Element> {
        self.flatten()
            .into_iter()
            .map(|(_, e)| e)
            .find(|e| e.matches_target(target))
    }

    pub fn has_search_field(&self) -> bool {
        self.flatten().into_iter().any(|(_, e)| {
            e.role.eq_ignore_ascii_case("searchbox")
                || (e.is_input() && e.name.to_lowercase().contains("search"))
        })
    }

    /// 目标不存在时的候选替代目标：名称与目标词重叠的可交互元素优先，其次同为输入框/按钮的元素
    pub fn alternative_targets(&self, target: &str, limit: usize) -> Vec<String> {
        let target_lower = target.to_lowercase();
        let words: Vec<&str> = target_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 1)
            .collect();
        let interactive: Vec<&Element> = self
            .flatten()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.is_interactive() && !e.matches_target(target))
            .collect();

        let mut out: Vec<String> = Vec::new();
        let push = |r: &str, out: &mut Vec<String>| {
            if !r.is_empty() && !out.iter().any(|x| x == r) {
                out.push(r.to_string());
            }
        };
        for e in &interactive {
            let name = e.name.to_lowercase();
            if words.iter().any(|w| name.contains(w)) {
                push(e.reference(), &mut out);
            }
        }
        for e in &interactive {
            push(e.reference(), &mut out);
        }
        out.truncate(limit);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.title.is_none() && self.elements.is_empty() && self.text.is_none()
    }
}
