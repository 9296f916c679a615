//! Instance selection strategies.

use rand::Rng;
use std::collections::{BTreeMap, HashMap};

/// How an [`InstancePool`](super::InstancePool) chooses among idle instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchedulingStrategy {
    /// Cycle through instances in creation order.
    #[default]
    RoundRobin,
    /// Fewest inferences, then lowest average latency, then oldest.
    LeastLoaded,
    /// Uniform choice.
    Random,
    /// Highest priority; ties go round-robin.
    Priority,
    /// Route an affinity key to the same instance while it exists.
    Sticky,
}

impl SchedulingStrategy {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulingStrategy::RoundRobin => "round_robin",
            SchedulingStrategy::LeastLoaded => "least_loaded",
            SchedulingStrategy::Random => "random",
            SchedulingStrategy::Priority => "priority",
            SchedulingStrategy::Sticky => "sticky",
        }
    }
}

impl std::fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An idle instance offered to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub id: u64,
    pub inference_count: u64,
    pub avg_latency_ns: f64,
    pub priority: i32,
}

/// What the instance bound to an affinity key is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Idle,
    Busy,
    Gone,
}

/// Scheduler verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Selection {
    /// Hand out this idle instance.
    Pick(u64),
    /// The key's instance is busy; wait for it.
    Wait,
    /// Nothing suitable is idle.
    NoneIdle,
}

/// Affinity keys and the instance each is bound to.
///
/// Holds at most `capacity` keys; binding a new key past that forgets the
/// least recently used one.
#[derive(Debug)]
struct Affinity {
    capacity: usize,
    tick: u64,
    /// key -> (instance id, last use)
    bindings: HashMap<String, (u64, u64)>,
    /// last use -> key
    recency: BTreeMap<u64, String>,
}

impl Affinity {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            bindings: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Bound instance, marking the key as used.
    fn get(&mut self, key: &str) -> Option<u64> {
        let tick = self.next_tick();
        let (id, used) = self.bindings.get_mut(key)?;
        let previous = std::mem::replace(used, tick);
        let id = *id;
        if let Some(owned) = self.recency.remove(&previous) {
            self.recency.insert(tick, owned);
        }
        Some(id)
    }

    fn insert(&mut self, key: &str, id: u64) {
        let tick = self.next_tick();
        if let Some((_, used)) = self.bindings.insert(key.to_string(), (id, tick)) {
            self.recency.remove(&used);
        }
        self.recency.insert(tick, key.to_string());
        while self.bindings.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.bindings.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some((_, used)) = self.bindings.remove(key) {
            self.recency.remove(&used);
        }
    }

    fn remove_instance(&mut self, id: u64) {
        let recency = &mut self.recency;
        self.bindings.retain(|_, (bound, used)| {
            if *bound == id {
                recency.remove(&*used);
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    fn peek(&self, key: &str) -> Option<u64> {
        self.bindings.get(key).map(|(id, _)| *id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.bindings.len()
    }
}

/// Selection state of one pool. Guarded by the pool lock.
#[derive(Debug)]
pub(crate) struct Scheduler {
    strategy: SchedulingStrategy,
    fallback: SchedulingStrategy,
    /// Next id in round-robin order.
    cursor: u64,
    affinity: Affinity,
}

impl Scheduler {
    pub fn new(strategy: SchedulingStrategy, fallback: SchedulingStrategy, affinity_capacity: usize) -> Self {
        let fallback = if fallback == SchedulingStrategy::Sticky {
            SchedulingStrategy::LeastLoaded
        } else {
            fallback
        };
        Self {
            strategy,
            fallback,
            cursor: 0,
            affinity: Affinity::new(affinity_capacity),
        }
    }

    /// Choose among `idle` (sorted by id).
    ///
    /// `binding` reports the state of the instance an affinity key is bound
    /// to; it is only consulted by the sticky strategy.
    pub fn select(
        &mut self,
        idle: &[Candidate],
        key: Option<&str>,
        binding: impl Fn(u64) -> Binding,
    ) -> Selection {
        if self.strategy == SchedulingStrategy::Sticky {
            if let Some(key) = key {
                if let Some(bound) = self.affinity.get(key) {
                    match binding(bound) {
                        Binding::Idle => return Selection::Pick(bound),
                        Binding::Busy => return Selection::Wait,
                        Binding::Gone => {
                            self.affinity.remove(key);
                        }
                    }
                }
                let picked = self.pick(self.fallback, idle);
                if let Some(id) = picked {
                    self.affinity.insert(key, id);
                }
                return picked.map_or(Selection::NoneIdle, Selection::Pick);
            }
        }
        let strategy = if self.strategy == SchedulingStrategy::Sticky {
            self.fallback
        } else {
            self.strategy
        };
        self.pick(strategy, idle)
            .map_or(Selection::NoneIdle, Selection::Pick)
    }

    fn pick(&mut self, strategy: SchedulingStrategy, idle: &[Candidate]) -> Option<u64> {
        if idle.is_empty() {
            return None;
        }
        let id = match strategy {
            SchedulingStrategy::RoundRobin | SchedulingStrategy::Sticky => self.round_robin(idle),
            SchedulingStrategy::LeastLoaded => idle
                .iter()
                .min_by(|a, b| {
                    a.inference_count
                        .cmp(&b.inference_count)
                        .then(a.avg_latency_ns.total_cmp(&b.avg_latency_ns))
                        .then(a.id.cmp(&b.id))
                })
                .map(|c| c.id)?,
            SchedulingStrategy::Random => idle[rand::thread_rng().gen_range(0..idle.len())].id,
            SchedulingStrategy::Priority => {
                let top = idle.iter().map(|c| c.priority).max()?;
                let tied: Vec<Candidate> = idle.iter().copied().filter(|c| c.priority == top).collect();
                self.round_robin(&tied)
            }
        };
        Some(id)
    }

    /// Smallest id at or after the cursor, wrapping to the smallest id.
    fn round_robin(&mut self, idle: &[Candidate]) -> u64 {
        let id = idle
            .iter()
            .map(|c| c.id)
            .filter(|&id| id >= self.cursor)
            .min()
            .or_else(|| idle.iter().map(|c| c.id).min())
            .unwrap_or(self.cursor);
        self.cursor = id + 1;
        id
    }

    /// A new instance was created for this request; it is next in line.
    pub fn on_created(&mut self, id: u64, key: Option<&str>) {
        self.cursor = id + 1;
        if self.strategy == SchedulingStrategy::Sticky {
            if let Some(key) = key {
                self.affinity.insert(key, id);
            }
        }
    }

    /// Forget affinities to an evicted instance.
    pub fn on_removed(&mut self, id: u64) {
        self.affinity.remove_instance(id);
    }

    #[cfg(test)]
    pub fn bound(&self, key: &str) -> Option<u64> {
        self.affinity.peek(key)
    }
}
