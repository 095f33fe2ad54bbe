use crate::core::EntityKey;
use crate::entity::Appendix;
use dashmap::DashMap;

struct Cached {
    appendix: Appendix,
    touched: u64,
}

/// Node-local cache of appendices, evicted after an idle period.
#[derive(Default)]
pub struct AppendixCache {
    entries: DashMap<EntityKey, Cached>,
}

impl AppendixCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a cached appendix and refreshes its last-touch time.
    pub fn get(&self, key: &EntityKey, now: u64) -> Option<Appendix> {
        let mut entry = self.entries.get_mut(key)?;
        entry.touched = now;
        Some(entry.appendix.clone())
    }

    /// Caches an appendix.
    pub fn put(&self, appendix: Appendix, now: u64) {
        self.entries.insert(
            appendix.owner.key().clone(),
            Cached {
                appendix,
                touched: now,
            },
        );
    }

    /// Evicts entries untouched for longer than `idle_ms`. Returns how many
    /// were evicted.
    pub fn sweep(&self, now: u64, idle_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, cached| now.saturating_sub(cached.touched) <= idle_ms);
        before.saturating_sub(self.entries.len())
    }

    /// Number of cached appendices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
