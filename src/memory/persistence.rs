//! 情景记忆持久化
//!
//! 目录下单个 JSON Lines 文件（episodes.jsonl），每次 store 追加一行并 fsync；
//! 启动时按插入顺序读回。日志过长时通过「写临时文件再 rename」整体压缩，
//! 中途崩溃不会破坏已落盘的记录。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::core::AgentError;
use crate::memory::Episode;

const LOG_FILE: &str = "episodes.jsonl";
const TMP_FILE: &str = "episodes.jsonl.tmp";

/// 追加式情景日志
#[derive(Debug)]
pub struct EpisodeLog {
    dir: PathBuf,
    /// 当前文件中的记录行数（决定何时压缩）
    records: usize,
}

impl EpisodeLog {
    /// 打开（必要时创建）持久化目录
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, records: 0 })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// 按插入顺序读回全部记录；文件不存在时返回空 Vec。
    /// 无法解析的行（如崩溃时写了一半的末行）跳过并告警。
    pub fn load(&mut self) -> Result<Vec<Episode>, AgentError> {
        let path = self.path();
        if !path.exists() {
            self.records = 0;
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut episodes = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Episode>(&line) {
                Ok(ep) => episodes.push(ep),
                Err(e) => {
                    tracing::warn!(
                        "Skipping unreadable episode record at {}:{}: {}",
                        path.display(),
                        lineno + 1,
                        e
                    );
                }
            }
        }
        self.records = episodes.len();
        Ok(episodes)
    }

    /// 追加一条记录并刷盘
    pub fn append(&mut self, episode: &Episode) -> Result<(), AgentError> {
        let line = serde_json::to_string(episode)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        file.sync_data()?;
        self.records += 1;
        Ok(())
    }

    /// 用当前内存中的记录重写日志：先写临时文件并 fsync，再原子 rename 覆盖
    pub fn compact<'a>(
        &mut self,
        episodes: impl IntoIterator<Item = &'a Episode>,
    ) -> Result<(), AgentError> {
        let tmp = self.dir.join(TMP_FILE);
        let mut count = 0;
        {
            let mut file = File::create(&tmp)?;
            for ep in episodes {
                writeln!(file, "{}", serde_json::to_string(ep)?)?;
                count += 1;
            }
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.path())?;
        self.records = count;
        tracing::debug!("Compacted episode log to {} records", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Fingerprint;

    fn ep(seq: u64) -> Episode {
        Episode {
            seq,
            fingerprint: Fingerprint::from("00000000deadbeef"),
            action: format!("click('a{}')", seq),
            outcome: "ok".to_string(),
            success: true,
            domain: "catalog".to_string(),
            execution_time: 0.5,
            confidence: 0.8,
            recorded_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_append_then_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EpisodeLog::open(dir.path()).unwrap();
        for i in 0..3 {
            log.append(&ep(i)).unwrap();
        }
        let mut reopened = EpisodeLog::open(dir.path()).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(reopened.records(), 3);
    }

    #[test]
    fn test_torn_last_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EpisodeLog::open(dir.path()).unwrap();
        log.append(&ep(0)).unwrap();
        let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
        write!(f, "{{\"seq\": 1, \"fingerp").unwrap();
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_compact_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = EpisodeLog::open(dir.path()).unwrap();
        let all: Vec<Episode> = (0..5).map(ep).collect();
        for e in &all {
            log.append(e).unwrap();
        }
        log.compact(all[3..].iter()).unwrap();
        assert_eq!(log.records(), 2);
        assert!(!dir.path().join(TMP_FILE).exists());
        let loaded = log.load().unwrap();
        assert_eq!(loaded.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
    }
}
