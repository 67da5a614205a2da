use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bloom::{BloomFilter, ASMS};

/// After this many insertions the current filter is rotated out. Matches
/// the "~10^6" capacity the design calls for.
const MAX_ELEMENTS: u32 = 1_000_000;
const FALSE_POSITIVE_RATE: f32 = 1e-6;

struct Generations {
    current: BloomFilter,
    prior: Option<BloomFilter>,
}

fn new_filter() -> BloomFilter {
    BloomFilter::with_rate(FALSE_POSITIVE_RATE, MAX_ELEMENTS)
}

/// Process-wide approximate set of recently seen salts. `add`/`contains`
/// are O(1) expected; after `MAX_ELEMENTS` insertions the filter rotates
/// wholesale (not LRU), keeping one prior generation so a salt inserted
/// just before rotation is still caught for one more cycle.
pub struct ReplayGuard {
    generations: RwLock<Generations>,
    inserted: AtomicU64,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self {
            generations: RwLock::new(Generations {
                current: new_filter(),
                prior: None,
            }),
            inserted: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, salt: &[u8]) -> bool {
        let gens = self.generations.read().unwrap();
        gens.current.contains(&salt)
            || gens
                .prior
                .as_ref()
                .map(|p| p.contains(&salt))
                .unwrap_or(false)
    }

    /// Inserts `salt`, rotating generations if capacity was reached.
    pub fn add(&self, salt: &[u8]) {
        let mut gens = self.generations.write().unwrap();
        gens.current.insert(&salt);
        let count = self.inserted.fetch_add(1, Ordering::Relaxed) + 1;
        if count as u32 >= MAX_ELEMENTS {
            let retiring = std::mem::replace(&mut gens.current, new_filter());
            gens.prior = Some(retiring);
            self.inserted.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let guard = ReplayGuard::new();
        assert!(!guard.contains(b"salt-a"));
        guard.add(b"salt-a");
        assert!(guard.contains(b"salt-a"));
    }

    #[test]
    fn distinct_salts_independent() {
        let guard = ReplayGuard::new();
        guard.add(b"one");
        assert!(guard.contains(b"one"));
        assert!(!guard.contains(b"two"));
    }

    #[test]
    fn rotation_keeps_guard_usable() {
        let guard = ReplayGuard::new();
        for i in 0..(MAX_ELEMENTS as u64 + 10) {
            guard.add(&i.to_le_bytes());
        }
        // the guard must not panic and must still answer queries.
        guard.add(b"post-rotation");
        assert!(guard.contains(b"post-rotation"));
    }
}
