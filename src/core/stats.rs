use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Counters for one search stream, finalized when the result is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    pub started_at: DateTime<Utc>,
    pub documents_seen: u64,
    pub documents_matched: u64,
    pub took_ms: u64,
}

impl SearchStats {
    pub fn start() -> Self {
        SearchStats {
            started_at: Utc::now(),
            documents_seen: 0,
            documents_matched: 0,
            took_ms: 0,
        }
    }

    pub fn finish(&mut self) {
        self.took_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_sets_duration() {
        let mut stats = SearchStats::start();
        stats.documents_seen = 3;
        stats.finish();
        assert!(stats.took_ms < 10_000);
        assert_eq!(stats.documents_seen, 3);
    }
}
