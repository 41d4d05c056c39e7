/// Replica guardrails: bounds on group size, ban-list growth, refresh rate,
/// and retry budgets.
///
/// The service enforces its own limits; these exist so the client rejects or
/// bounds work before burning a network round-trip, and so caches stay small
/// on mobile devices.
use std::time::Duration;

/// Max full members the client will accept in a group.
pub const MAX_GROUP_MEMBERS: usize = 1_001;

/// Max banned members retained per group. On overflow the oldest ban (by ban
/// timestamp, tie-break by member id) is evicted. This eviction order is a
/// contract, not an implementation detail.
pub const MAX_BANNED_MEMBERS: usize = 100;

/// Minimum interval between successive best-effort background refreshes of
/// the same group. Explicit (immediate-mode) refreshes bypass this.
pub const REFRESH_THROTTLE: Duration = Duration::from_secs(5 * 60);

/// Attempts per refresh, with the whole fetch-apply unit as the retry
/// granularity.
pub const FETCH_ATTEMPTS: u32 = 3;

/// Deadline for one fetch-apply attempt (and for a migration attempt).
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Change pages kept in the in-memory page cache.
pub const CHANGE_PAGE_CACHE_ENTRIES: usize = 32;

/// Decrypted blob / identifier results kept in the cipher cache.
pub const BLOB_CACHE_ENTRIES: usize = 256;
