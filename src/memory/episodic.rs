//! 情景记忆：有界的 (情境, 动作, 结果) 记录
//!
//! 环形缓冲语义：超过容量时最早的记录先被淘汰。recall 按「指纹精确匹配 → 同领域（成功优先、
//! 越新越前）→ 其余按新旧」排序；可选持久化到 EpisodeLog。
//! 多个 worker 共享时使用 SharedEpisodicMemory：写操作串行化在同一把写锁下，读看到一致快照。

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::{EpisodeLog, Fingerprint};

/// 一条情景记录（存入后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// 创建顺序（单调递增）
    pub seq: u64,
    pub fingerprint: Fingerprint,
    pub action: String,
    pub outcome: String,
    pub success: bool,
    pub domain: String,
    /// 执行耗时（秒）
    pub execution_time: f64,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

/// 某领域的历史统计
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DomainInsights {
    pub total_episodes: usize,
    pub successful_episodes: usize,
    pub success_rate: f64,
    pub avg_execution_time: f64,
    /// 成功次数最多的动作（最多 5 个）
    pub most_successful_actions: Vec<(String, usize)>,
    /// 失败结果归类计数：timeout / error / element_not_found / other
    pub failure_patterns: Vec<(String, usize)>,
}

#[derive(Debug)]
pub struct EpisodicMemory {
    episodes: VecDeque<Episode>,
    capacity: usize,
    next_seq: u64,
    log: Option<EpisodeLog>,
}

impl EpisodicMemory {
    /// 纯内存实现；容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            episodes: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
            log: None,
        }
    }

    /// 带持久化：从 dir/episodes.jsonl 读回最近 capacity 条记录
    pub fn with_persistence(capacity: usize, dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let mut memory = Self::new(capacity);
        let mut log = EpisodeLog::open(dir)?;
        let loaded = log.load()?;
        let total = loaded.len();
        for ep in loaded {
            memory.next_seq = memory.next_seq.max(ep.seq + 1);
            memory.episodes.push_back(ep);
            if memory.episodes.len() > memory.capacity {
                memory.episodes.pop_front();
            }
        }
        if total > memory.capacity {
            log.compact(memory.episodes.iter())?;
        }
        tracing::info!(
            "EpisodicMemory restored {} episodes from {}",
            memory.episodes.len(),
            log.path().display()
        );
        memory.log = Some(log);
        Ok(memory)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    /// 按插入顺序（最旧在前）遍历
    pub fn episodes(&self) -> impl Iterator<Item = &Episode> {
        self.episodes.iter()
    }

    /// 追加一条记录；execution_time 必须是非负有限数，confidence 必须在 [0,1]
    #[allow(clippy::too_many_arguments)]
    pub fn store_episode(
        &mut self,
        fingerprint: Fingerprint,
        action: &str,
        outcome: &str,
        success: bool,
        domain: &str,
        execution_time: f64,
        confidence: f64,
    ) -> Result<&Episode, AgentError> {
        if !execution_time.is_finite() || execution_time < 0.0 {
            return Err(AgentError::InvalidArgument(format!(
                "execution_time must be a non-negative number, got {}",
                execution_time
            )));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(AgentError::InvalidArgument(format!(
                "confidence must be within [0, 1], got {}",
                confidence
            )));
        }

        let episode = Episode {
            seq: self.next_seq,
            fingerprint,
            action: action.to_string(),
            outcome: outcome.to_string(),
            success,
            domain: domain.to_string(),
            execution_time,
            confidence,
            recorded_at: Utc::now(),
        };
        self.next_seq += 1;

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&episode) {
                tracing::warn!("Failed to persist episode {}: {}", episode.seq, e);
            }
        }

        tracing::debug!(
            "Stored episode #{}: {} -> {} (success: {})",
            episode.seq,
            episode.action,
            episode.outcome,
            episode.success
        );
        self.episodes.push_back(episode);
        while self.episodes.len() > self.capacity {
            self.episodes.pop_front();
        }

        let capacity = self.capacity;
        if let Some(log) = self.log.as_mut() {
            if log.records() > capacity * 2 {
                if let Err(e) = log.compact(self.episodes.iter()) {
                    tracing::warn!("Episode log compaction failed: {}", e);
                }
            }
        }

        self.episodes
            .back()
            .ok_or_else(|| AgentError::InvalidArgument("episode buffer is empty".to_string()))
    }

    /// 检索至多 k 条相关记录；空记忆返回空 Vec
    pub fn recall(&self, fingerprint: &Fingerprint, domain: &str, k: usize) -> Vec<Episode> {
        if k == 0 {
            return Vec::new();
        }
        let mut ranked: Vec<&Episode> = self.episodes.iter().collect();
        ranked.sort_by_key(|ep| {
            let tier: u8 = if &ep.fingerprint == fingerprint {
                0
            } else if ep.domain == domain {
                1
            } else {
                2
            };
            let failed = tier < 2 && !ep.success;
            (tier, failed, Reverse(ep.seq))
        });
        ranked.into_iter().take(k).cloned().collect()
    }

    /// 当前状态下历史表现最好的动作及其置信度。
    /// 精确指纹：成功率 × 平均置信度（成功率需 > 0.3）；否则退回该领域成功超过一次的动作，置信度上限 0.7。
    pub fn best_action_for_state(&self, fingerprint: &Fingerprint, domain: &str) -> Option<(String, f64)> {
        let mut stats: HashMap<&str, (usize, usize, f64)> = HashMap::new();
        for ep in self.episodes.iter().filter(|ep| &ep.fingerprint == fingerprint) {
            let entry = stats.entry(ep.action.as_str()).or_insert((0, 0, 0.0));
            entry.1 += 1;
            entry.2 += ep.confidence;
            if ep.success {
                entry.0 += 1;
            }
        }
        let mut candidates: Vec<(String, f64)> = stats
            .into_iter()
            .filter_map(|(action, (ok, total, conf_sum))| {
                let rate = ok as f64 / total as f64;
                (rate > 0.3).then(|| (action.to_string(), rate * conf_sum / total as f64))
            })
            .collect();

        if candidates.is_empty() {
            let mut counts: HashMap<&str, usize> = HashMap::new();
            for ep in self.episodes.iter().filter(|ep| ep.domain == domain && ep.success) {
                *counts.entry(ep.action.as_str()).or_insert(0) += 1;
            }
            candidates = counts
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(action, n)| (action.to_string(), (n as f64 / 10.0).min(0.7)))
                .collect();
        }

        // 置信度相同按动作名排序，保证结果确定
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let best = candidates.into_iter().next();
        if let Some((action, confidence)) = &best {
            tracing::debug!("Memory suggests action: {} (confidence: {:.2})", action, confidence);
        }
        best
    }

    pub fn domain_insights(&self, domain: &str) -> DomainInsights {
        let domain_eps: Vec<&Episode> = self.episodes.iter().filter(|ep| ep.domain == domain).collect();
        if domain_eps.is_empty() {
            return DomainInsights::default();
        }
        let successful: Vec<&&Episode> = domain_eps.iter().filter(|ep| ep.success).collect();

        let mut action_counts: HashMap<&str, usize> = HashMap::new();
        for ep in &successful {
            *action_counts.entry(ep.action.as_str()).or_insert(0) += 1;
        }
        let mut top: Vec<(String, usize)> = action_counts
            .into_iter()
            .map(|(a, n)| (a.to_string(), n))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(5);

        let mut failures: HashMap<&'static str, usize> = HashMap::new();
        for ep in domain_eps.iter().filter(|ep| !ep.success) {
            let outcome = ep.outcome.to_lowercase();
            let bucket = if outcome.contains("timeout") {
                "timeout"
            } else if outcome.contains("not found") || outcome.contains("target_not_found") {
                "element_not_found"
            } else if outcome.contains("error") {
                "error"
            } else {
                "other"
            };
            *failures.entry(bucket).or_insert(0) += 1;
        }
        let mut failure_patterns: Vec<(String, usize)> = failures
            .into_iter()
            .map(|(k, n)| (k.to_string(), n))
            .collect();
        failure_patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let total = domain_eps.len();
        DomainInsights {
            total_episodes: total,
            successful_episodes: successful.len(),
            success_rate: successful.len() as f64 / total as f64,
            avg_execution_time: domain_eps.iter().map(|ep| ep.execution_time).sum::<f64>() / total as f64,
            most_successful_actions: top,
            failure_patterns,
        }
    }
}

impl Default for EpisodicMemory {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// 进程内共享的情景记忆：单写锁串行化 store/淘汰/落盘，recall 只读
#[derive(Clone, Debug)]
pub struct SharedEpisodicMemory {
    inner: Arc<RwLock<EpisodicMemory>>,
}

impl SharedEpisodicMemory {
    pub fn new(memory: EpisodicMemory) -> Self {
        Self {
            inner: Arc::new(RwLock::new(memory)),
        }
    }

    /// 写入并返回存入记录的副本
    #[allow(clippy::too_many_arguments)]
    pub fn store_episode(
        &self,
        fingerprint: Fingerprint,
        action: &str,
        outcome: &str,
        success: bool,
        domain: &str,
        execution_time: f64,
        confidence: f64,
    ) -> Result<Episode, AgentError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let episode = guard
            .store_episode(fingerprint, action, outcome, success, domain, execution_time, confidence)?
            .clone();
        Ok(episode)
    }

    pub fn recall(&self, fingerprint: &Fingerprint, domain: &str, k: usize) -> Vec<Episode> {
        self.read().recall(fingerprint, domain, k)
    }

    pub fn best_action_for_state(&self, fingerprint: &Fingerprint, domain: &str) -> Option<(String, f64)> {
        self.read().best_action_for_state(fingerprint, domain)
    }

    pub fn domain_insights(&self, domain: &str) -> DomainInsights {
        self.read().domain_insights(domain)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 一致快照（插入顺序）
    pub fn snapshot(&self) -> Vec<Episode> {
        self.read().episodes().cloned().collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EpisodicMemory> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SharedEpisodicMemory {
    fn default() -> Self {
        Self::new(EpisodicMemory::default())
    }
}
