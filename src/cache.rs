/// In-memory LRU cache of fetched change-log pages.
///
/// Pagination often re-requests the same starting revision (app restart,
/// deferred lane following the immediate lane); serving those from memory
/// avoids a round trip. Entries are keyed by (group, start revision) and
/// only served while they still cover the caller's target revision.
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::ids::GroupId;
use crate::limits::CHANGE_PAGE_CACHE_ENTRIES;
use crate::wire::ChangePage;

struct CachedPage {
    page: ChangePage,
    /// Last revision the page carries; entries ending at or below the local
    /// persisted revision are useless and get dropped.
    end_revision: u32,
}

pub struct ChangePageCache {
    inner: Mutex<LruCache<(GroupId, u32), CachedPage>>,
}

impl Default for ChangePageCache {
    fn default() -> Self {
        ChangePageCache::new(CHANGE_PAGE_CACHE_ENTRIES)
    }
}

impl ChangePageCache {
    pub fn new(capacity: usize) -> Self {
        ChangePageCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
        }
    }

    /// Look up a page starting at `from_revision` that still reaches past
    /// `local_revision`. A stale hit is evicted on the spot.
    pub fn get(
        &self,
        group: &GroupId,
        from_revision: u32,
        local_revision: u32,
    ) -> Option<ChangePage> {
        let mut cache = self.inner.lock().unwrap();
        let key = (*group, from_revision);
        match cache.get(&key) {
            Some(entry) if entry.end_revision > local_revision => Some(entry.page.clone()),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, group: &GroupId, from_revision: u32, page: ChangePage) {
        let end_revision = match page.last_revision() {
            Some(r) => r,
            // Pages without any change entry carry nothing worth replaying.
            None => return,
        };
        let mut cache = self.inner.lock().unwrap();
        cache.put((*group, from_revision), CachedPage { page, end_revision });
    }

    /// Drop every cached page for `group` that ends at or below `revision`.
    /// Called after the local model advances.
    pub fn invalidate_through(&self, group: &GroupId, revision: u32) {
        let mut cache = self.inner.lock().unwrap();
        let stale: Vec<(GroupId, u32)> = cache
            .iter()
            .filter(|(key, entry)| key.0 == *group && entry.end_revision <= revision)
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ChangeActionSet;
    use crate::ids::OpaqueUserId;
    use crate::wire::ChangeLogEntry;

    fn page_ending_at(revision: u32) -> ChangePage {
        ChangePage {
            entries: vec![ChangeLogEntry {
                change: Some(ChangeActionSet::new(
                    revision,
                    OpaqueUserId::from_bytes(vec![7]),
                    vec![],
                )),
                snapshot: None,
            }],
            partial: None,
        }
    }

    fn gid(tag: u8) -> GroupId {
        GroupId::from_bytes([tag; 32])
    }

    #[test]
    fn test_hit_requires_coverage_past_local_revision() {
        let cache = ChangePageCache::new(4);
        cache.put(&gid(1), 3, page_ending_at(8));

        assert!(cache.get(&gid(1), 3, 5).is_some());
        // Local model already at the page's end; the entry is stale and gone.
        assert!(cache.get(&gid(1), 3, 8).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_invalidate_through_drops_only_covered_pages() {
        let cache = ChangePageCache::new(4);
        cache.put(&gid(1), 1, page_ending_at(4));
        cache.put(&gid(1), 5, page_ending_at(9));
        cache.put(&gid(2), 1, page_ending_at(4));

        cache.invalidate_through(&gid(1), 4);

        assert!(cache.get(&gid(1), 1, 0).is_none());
        assert!(cache.get(&gid(1), 5, 0).is_some());
        assert!(cache.get(&gid(2), 1, 0).is_some());
    }

    #[test]
    fn test_empty_page_is_not_cached() {
        let cache = ChangePageCache::new(4);
        cache.put(&gid(1), 1, ChangePage::default());
        assert_eq!(cache.len(), 0);
    }
}
