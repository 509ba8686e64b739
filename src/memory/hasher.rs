//! 状态指纹：将观察规范化后做非加密摘要
//!
//! 参与摘要的只有语义相关部分：目的地（url，去掉锚点与易变查询参数）、标题、
//! 可交互元素树（保序，空白折叠，时间戳/日期掩码，忽略临时 bid）。
//! 同一逻辑页面经不同路径到达时得到同一指纹，供记忆检索与停滞检测使用。

use std::fmt;
use std::hash::Hasher;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::memory::Observation;

/// 缺失字段的固定占位
const SENTINEL: &str = "<none>";
/// 不影响页面语义的查询参数（缓存击穿、会话、时间戳）
const VOLATILE_QUERY_KEYS: &[&str] = &["_", "t", "ts", "timestamp", "cb", "nonce", "sid", "session"];

static VOLATILE_RE: OnceLock<Regex> = OnceLock::new();

fn volatile_re() -> &'static Regex {
    VOLATILE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b\d{4}-\d{2}-\d{2}(?:[t ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?z?)?\b|\b\d{1,2}:\d{2}(?::\d{2})?(?:\s?[ap]m)?\b|\b\d{10,13}\b",
        )
        .unwrap()
    })
}

/// 状态指纹：16 位十六进制
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 无状态的指纹计算器
#[derive(Debug, Default, Clone, Copy)]
pub struct StateHasher;

impl StateHasher {
    pub fn new() -> Self {
        Self
    }

    /// 计算观察的指纹；纯函数，不会失败
    pub fn hash(&self, obs: &Observation) -> Fingerprint {
        let canonical = Self::canonicalize(obs);
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(canonical.as_bytes());
        Fingerprint(format!("{:016x}", hasher.finish()))
    }

    /// 规范化串（便于调试时比较两个观察为何指纹不同）
    pub fn canonicalize(obs: &Observation) -> String {
        let url = obs
            .url
            .as_deref()
            .map(normalize_url)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| SENTINEL.to_string());
        let title = obs
            .title
            .as_deref()
            .map(normalize_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| SENTINEL.to_string());

        let mut s = format!("url={}\ntitle={}\n", url, title);
        let flat = obs.flatten();
        if flat.is_empty() {
            s.push_str(SENTINEL);
            s.push('\n');
        }
        for (depth, e) in flat {
            s.push_str(&format!(
                "{}|{}|{}|{}\n",
                depth,
                e.role.trim().to_lowercase(),
                normalize_text(&e.name),
                e.value.as_deref().map(normalize_text).unwrap_or_default()
            ));
        }
        s
    }
}

/// 空白折叠 + 易变片段（时间、日期、时间戳）掩码
pub(crate) fn normalize_text(s: &str) -> String {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    volatile_re().replace_all(&collapsed, "#").into_owned()
}

fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url);
    let (base, query) = match url.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (url, None),
    };
    let base = base.trim_end_matches('/');
    let kept: Vec<&str> = query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .filter(|pair| {
                    let key = pair.split('=').next().unwrap_or(pair).to_lowercase();
                    !VOLATILE_QUERY_KEYS.contains(&key.as_str())
                })
                .collect()
        })
        .unwrap_or_default();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Element;

    fn page(bid: &str, clock: &str) -> Observation {
        Observation::new("https://shop.test/search?q=lamp&ts=1718000000", "Results  for lamp")
            .with_elements(vec![
                Element::new("searchbox", "Search").with_bid(bid).with_value("lamp"),
                Element::new("text", format!("Updated {}", clock)),
                Element::new("link", "Desk lamp"),
            ])
    }

    #[test]
    fn test_volatile_noise_ignored() {
        let h = StateHasher::new();
        let a = page("a12", "10:41:07");
        let mut b = page("b99", "10:43:52");
        b.url = Some("https://shop.test/search/?q=lamp&ts=1718000999#top".to_string());
        b.text = Some("rendered at 2024-06-01T10:00:00Z".to_string());
        assert_eq!(h.hash(&a), h.hash(&b));
    }

    #[test]
    fn test_different_elements_differ() {
        let h = StateHasher::new();
        let a = page("a12", "10:41");
        let mut b = a.clone();
        b.elements.push(Element::new("button", "Add to cart"));
        assert_ne!(h.hash(&a), h.hash(&b));
    }

    #[test]
    fn test_element_order_matters() {
        let h = StateHasher::new();
        let a = page("a12", "10:41");
        let mut b = a.clone();
        b.elements.reverse();
        assert_ne!(h.hash(&a), h.hash(&b));
    }

    #[test]
    fn test_empty_observation_uses_sentinel() {
        let h = StateHasher::new();
        let fp = h.hash(&Observation::default());
        assert_eq!(fp.as_str().len(), 16);
        assert_eq!(fp, h.hash(&Observation::from_value(&serde_json::json!({}))));
        assert!(StateHasher::canonicalize(&Observation::default()).contains(SENTINEL));
    }

    #[test]
    fn test_normalize_url_keeps_semantic_query() {
        assert_eq!(normalize_url("https://a.test/x/?id=3&_=99#frag"), "https://a.test/x?id=3");
        assert_eq!(normalize_url("https://a.test/"), "https://a.test");
    }
}
