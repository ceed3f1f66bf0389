//! Backend Weigher
//!
//! Ranks filtered candidates. Higher score wins; equal scores fall back to
//! backend id order so the same snapshot and history always give the same
//! answer.

use super::filters::Candidate;
use crate::domain::ports::BackendId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Weights applied when ranking backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeigherConfig {
    /// Weight of normalized headroom (more free capacity is better)
    pub capacity_weight: f64,
    /// Weight of reported controller utilization (busier is worse)
    pub utilization_weight: f64,
    /// Penalty per recent pick of the same backend
    pub recency_penalty: f64,
}

impl Default for WeigherConfig {
    fn default() -> Self {
        Self {
            capacity_weight: 1.0,
            utilization_weight: 0.25,
            recency_penalty: 0.1,
        }
    }
}

/// A candidate with its score
#[derive(Debug, Clone)]
pub struct WeighedCandidate {
    pub candidate: Candidate,
    pub score: f64,
}

/// Score and sort candidates, best first
pub fn weigh(
    candidates: Vec<Candidate>,
    config: &WeigherConfig,
    recent_picks: &HashMap<BackendId, u32>,
) -> Vec<WeighedCandidate> {
    let max_headroom = candidates
        .iter()
        .map(|c| c.headroom_bytes)
        .max()
        .unwrap_or(0)
        .max(1) as f64;

    let mut weighed: Vec<WeighedCandidate> = candidates
        .into_iter()
        .map(|candidate| {
            let capacity = candidate.headroom_bytes as f64 / max_headroom;
            let utilization = f64::from(candidate.backend.utilization_percent) / 100.0;
            let picks = recent_picks
                .get(&candidate.backend.backend_id)
                .copied()
                .unwrap_or(0);

            let score = config.capacity_weight * capacity
                - config.utilization_weight * utilization
                - config.recency_penalty * f64::from(picks);

            WeighedCandidate { candidate, score }
        })
        .collect();

    weighed.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.candidate
                    .backend
                    .backend_id
                    .cmp(&b.candidate.backend.backend_id)
            })
    });

    weighed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{BackendKind, CapabilitySet};
    use crate::registry::BackendDescriptor;
    use crate::scheduler::CapacityLedger;
    use chrono::Utc;

    fn candidate(id: &str, headroom: u64, utilization: u8) -> Candidate {
        Candidate {
            backend: BackendDescriptor {
                backend_id: BackendId::new(id),
                kind: BackendKind::Lvm,
                free_bytes: headroom,
                total_bytes: headroom,
                utilization_percent: utilization,
                reserved_percentage: 0,
                capabilities: CapabilitySet::default(),
                sequence_no: 1,
                first_seen: Utc::now(),
                last_report: Utc::now(),
            },
            ledger: CapacityLedger::default(),
            ledger_version: 0,
            headroom_bytes: headroom,
        }
    }

    fn order(weighed: &[WeighedCandidate]) -> Vec<&str> {
        weighed
            .iter()
            .map(|w| w.candidate.backend.backend_id.as_str())
            .collect()
    }

    #[test]
    fn test_more_headroom_wins() {
        let weighed = weigh(
            vec![candidate("small", 5, 0), candidate("large", 15, 0)],
            &WeigherConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(order(&weighed), vec!["large", "small"]);
    }

    #[test]
    fn test_ties_break_by_backend_id() {
        let weighed = weigh(
            vec![candidate("b", 10, 0), candidate("c", 10, 0), candidate("a", 10, 0)],
            &WeigherConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(order(&weighed), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_recent_picks_spread_load() {
        let mut recent = HashMap::new();
        recent.insert(BackendId::new("a"), 2);
        let weighed = weigh(
            vec![candidate("a", 10, 0), candidate("b", 10, 0)],
            &WeigherConfig::default(),
            &recent,
        );
        assert_eq!(order(&weighed), vec!["b", "a"]);
    }

    #[test]
    fn test_utilization_penalized() {
        let weighed = weigh(
            vec![candidate("busy", 10, 90), candidate("idle", 10, 5)],
            &WeigherConfig::default(),
            &HashMap::new(),
        );
        assert_eq!(order(&weighed), vec!["idle", "busy"]);
    }
}
