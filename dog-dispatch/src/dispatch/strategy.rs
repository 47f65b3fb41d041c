use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::WorkerId;

/// How a healthy member is picked for a synchronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,

    /// Fewest in-flight requests; ties go to the earliest registered member
    LeastBusy,

    /// Least used relative to configured weight
    WeightedRoundRobin,

    /// Same fingerprint, same member, while membership is stable
    ConsistentHash,

    Random,
}

impl SelectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastBusy => "least_busy",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::ConsistentHash => "consistent_hash",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_busy" | "least_connections" => Ok(Self::LeastBusy),
            "weighted_round_robin" | "weighted" => Ok(Self::WeightedRoundRobin),
            "consistent_hash" => Ok(Self::ConsistentHash),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown selection strategy '{}'", other)),
        }
    }
}

/// Live view of one healthy member at selection time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: WorkerId,

    /// In-flight requests
    pub active: usize,

    /// Requests handled so far
    pub total: u64,

    pub weight: u32,

    /// Registration order
    pub order: u64,
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a fingerprint of request bytes
///
/// Fixed across builds and toolchains, so processes agree on ring placement.
pub fn fingerprint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Consistent-hash ring with virtual nodes
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, WorkerId>,
}

impl HashRing {
    pub fn new<'a, I>(members: I, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = &'a WorkerId>,
    {
        let mut ring = BTreeMap::new();
        for member in members {
            for replica in 0..virtual_nodes.max(1) {
                let point = fingerprint(format!("{}#{}", member, replica).as_bytes());
                ring.insert(point, member.clone());
            }
        }
        Self { ring }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// First member clockwise from the fingerprint
    pub fn route(&self, fingerprint: u64) -> Option<&WorkerId> {
        self.ring
            .range(fingerprint..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| id)
    }
}

/// Applies a [`SelectionStrategy`] to a candidate list
#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick one candidate; `candidates` must be in registration order
    pub fn select(&self, candidates: &[Candidate], ring: Option<&HashRing>, fingerprint: u64) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                &candidates[index]
            }
            SelectionStrategy::LeastBusy => candidates
                .iter()
                .min_by_key(|c| (c.active, c.order))
                .unwrap_or(&candidates[0]),
            SelectionStrategy::WeightedRoundRobin => candidates
                .iter()
                .min_by(|a, b| {
                    let load_a = (a.total + a.active as u64) as f64 / a.weight.max(1) as f64;
                    let load_b = (b.total + b.active as u64) as f64 / b.weight.max(1) as f64;
                    load_a
                        .partial_cmp(&load_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.order.cmp(&b.order))
                })
                .unwrap_or(&candidates[0]),
            SelectionStrategy::ConsistentHash => {
                let routed = ring
                    .and_then(|ring| ring.route(fingerprint))
                    .and_then(|id| candidates.iter().find(|c| &c.id == id));
                routed.unwrap_or(&candidates[(fingerprint % candidates.len() as u64) as usize])
            }
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                &candidates[index]
            }
        };

        Some(chosen.id.clone())
    }
}
