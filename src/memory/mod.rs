//! 记忆层：状态指纹、情景记忆（跨 episode）、工作记忆（单 episode）与持久化

pub mod episodic;
pub mod hasher;
pub mod observation;
pub mod persistence;
pub mod working;

pub use episodic::{DomainInsights, Episode, EpisodicMemory, SharedEpisodicMemory};
pub use hasher::{Fingerprint, StateHasher};
pub use observation::{Element, Observation};
pub use persistence::EpisodeLog;
pub use working::{Goal, ProgressSummary, WorkingMemory};
