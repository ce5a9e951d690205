//! Weighted rotation of listeners, rebuilt on recalculation.
//!
//! A collection is immutable once built apart from its rotation cursors.
//! Recalculation builds a fresh one and swaps it in; the previous collection
//! is closed and hands out no further polls. Holders are shared between
//! generations, so a poll started from a closed collection still keeps its
//! client busy until it completes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::algorithm::ListenerPriorityAlgorithm;
use crate::holder::ClientHolder;

/// Most rotation entries a single client gets per level.
const MAX_SHARE: usize = 4;

struct Weighted {
    holder: Arc<ClientHolder>,
    weight: f64,
    share: usize,
}

#[derive(Default)]
struct LevelRing {
    clients: Vec<Weighted>,
    /// Indexes into `clients`, heavier clients appearing more often.
    sequence: Vec<usize>,
    cursor: AtomicUsize,
}

impl LevelRing {
    fn build(mut clients: Vec<Weighted>) -> Self {
        clients.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        let top = clients.first().map_or(0.0, |c| c.weight);
        for c in &mut clients {
            c.share = if top > 0.0 && c.weight > 0.0 {
                ((c.weight / top * MAX_SHARE as f64).ceil() as usize).clamp(1, MAX_SHARE)
            } else {
                1
            };
        }
        let mut sequence = Vec::new();
        for round in 0..MAX_SHARE {
            for (i, c) in clients.iter().enumerate() {
                if c.share > round {
                    sequence.push(i);
                }
            }
        }
        Self {
            clients,
            sequence,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightedClient {
    pub id: String,
    pub weight: f64,
    pub share: usize,
    pub polling: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LevelSummary {
    pub level: usize,
    pub clients: Vec<WeightedClient>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatistics {
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub closed: bool,
    pub levels: Vec<LevelSummary>,
}

pub struct ClientPriorityCollection {
    generation: u64,
    built_at: DateTime<Utc>,
    levels: Vec<LevelRing>,
    algorithm: Arc<dyn ListenerPriorityAlgorithm>,
    closed: AtomicBool,
}

impl ClientPriorityCollection {
    /// Rank `holders` into `priority_levels` rings. Clients above the top
    /// level are placed on it.
    pub fn build(
        generation: u64,
        holders: &[Arc<ClientHolder>],
        priority_levels: usize,
        algorithm: Arc<dyn ListenerPriorityAlgorithm>,
    ) -> Self {
        let levels = priority_levels.max(1);
        let mut buckets: Vec<Vec<Weighted>> = (0..levels).map(|_| Vec::new()).collect();
        for holder in holders {
            let level = holder.priority().min(levels - 1);
            buckets[level].push(Weighted {
                holder: Arc::clone(holder),
                weight: algorithm.weight(holder),
                share: 1,
            });
        }
        Self {
            generation,
            built_at: Utc::now(),
            levels: buckets.into_iter().map(LevelRing::build).collect(),
            algorithm,
            closed: AtomicBool::new(false),
        }
    }

    /// Empty, already-closed placeholder used before the first build.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            built_at: Utc::now(),
            levels: Vec::new(),
            algorithm: Arc::new(crate::algorithm::DefaultPriorityAlgorithm::default()),
            closed: AtomicBool::new(true),
        }
    }

    /// Next idle client on `level`, claimed for one poll, and the number of
    /// payloads it may fetch. `None` when every client on the level is busy,
    /// the level is empty, nothing is available or the collection is closed.
    pub fn take_next(&self, level: usize, available: usize) -> Option<(Arc<ClientHolder>, usize)> {
        if available == 0 || self.is_closed() {
            return None;
        }
        let ring = self.levels.get(level)?;
        let n = ring.sequence.len();
        for _ in 0..n {
            let pos = ring.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let holder = &ring.clients[ring.sequence[pos]].holder;
            if holder.try_acquire() {
                let batch = self.algorithm.batch_size(holder, available).clamp(1, available);
                return Some((Arc::clone(holder), batch));
            }
        }
        None
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|l| l.clients.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> CollectionStatistics {
        CollectionStatistics {
            generation: self.generation,
            built_at: self.built_at,
            closed: self.is_closed(),
            levels: self
                .levels
                .iter()
                .enumerate()
                .map(|(level, ring)| LevelSummary {
                    level,
                    clients: ring
                        .clients
                        .iter()
                        .map(|c| WeightedClient {
                            id: c.holder.id().to_string(),
                            weight: c.weight,
                            share: c.share,
                            polling: c.holder.is_polling(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use stellwerk_core::TransmissionPayload;

    use super::*;
    use crate::algorithm::DefaultPriorityAlgorithm;
    use crate::client::ListenerClient;
    use crate::error::CommsError;

    struct Named {
        id: String,
        priority: usize,
        weighting: f64,
    }

    #[async_trait]
    impl ListenerClient for Named {
        fn id(&self) -> &str {
            &self.id
        }

        fn channel_id(&self) -> &str {
            "orders"
        }

        fn priority(&self) -> usize {
            self.priority
        }

        fn weighting(&self) -> f64 {
            self.weighting
        }

        async fn poll(&self, _max: usize) -> Result<Vec<TransmissionPayload>, CommsError> {
            Ok(Vec::new())
        }
    }

    fn holder(id: &str, priority: usize, weighting: f64) -> Arc<ClientHolder> {
        Arc::new(ClientHolder::new(Arc::new(Named {
            id: id.to_string(),
            priority,
            weighting,
        })))
    }

    fn collection(holders: &[Arc<ClientHolder>], levels: usize) -> ClientPriorityCollection {
        ClientPriorityCollection::build(1, holders, levels, Arc::new(DefaultPriorityAlgorithm::new(5)))
    }

    #[test]
    fn clients_are_claimed_once_until_released() {
        let holders = vec![holder("a", 0, 1.0), holder("b", 0, 1.0)];
        let c = collection(&holders, 2);

        let (first, batch) = c.take_next(0, 3).unwrap();
        assert_eq!(batch, 3);
        let (second, _) = c.take_next(0, 3).unwrap();
        assert_ne!(first.id(), second.id());
        assert!(c.take_next(0, 3).is_none());

        first.release();
        assert_eq!(c.take_next(0, 3).unwrap().0.id(), first.id());
    }

    #[test]
    fn levels_are_separate() {
        let holders = vec![holder("low", 0, 1.0), holder("high", 1, 1.0), holder("over", 9, 1.0)];
        let c = collection(&holders, 2);
        assert_eq!(c.take_next(0, 1).unwrap().0.id(), "low");
        let top: Vec<String> = std::iter::from_fn(|| c.take_next(1, 1))
            .map(|(h, _)| h.id().to_string())
            .collect();
        assert_eq!(top.len(), 2);
        assert!(c.take_next(5, 1).is_none());
    }

    #[test]
    fn heavier_clients_get_more_turns() {
        let holders = vec![holder("heavy", 0, 4.0), holder("light", 0, 1.0)];
        let c = collection(&holders, 1);
        let mut turns: HashMap<String, u32> = HashMap::new();
        for _ in 0..50 {
            let (h, _) = c.take_next(0, 1).unwrap();
            *turns.entry(h.id().to_string()).or_default() += 1;
            h.release();
        }
        assert_eq!(turns["heavy"], 40);
        assert_eq!(turns["light"], 10);
    }

    #[test]
    fn closed_collection_hands_out_nothing() {
        let holders = vec![holder("a", 0, 1.0)];
        let c = collection(&holders, 1);
        c.close();
        assert!(c.take_next(0, 1).is_none());
        assert!(!holders[0].is_polling());
        assert!(ClientPriorityCollection::empty().take_next(0, 1).is_none());
    }

    #[test]
    fn nothing_available_means_no_poll() {
        let holders = vec![holder("a", 0, 1.0)];
        let c = collection(&holders, 1);
        assert!(c.take_next(0, 0).is_none());
        assert!(!holders[0].is_polling());
    }
}
