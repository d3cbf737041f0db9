use crate::common::{AccessCount, RowHandle, RowPos, MIN_RETAINED_ROWS};

/// A resident row as seen by one eviction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub handle: RowHandle,
    pub pos: RowPos,
    pub last_access: AccessCount,
}

impl EvictionCandidate {
    /// Rank key: older accesses first, lower offsets first among equals.
    fn rank(&self) -> (AccessCount, RowPos) {
        (self.last_access, self.pos)
    }
}

/// Rows chosen by one pass, in ascending offset order so writes stay
/// sequential, and the access count at the cut.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub victims: Vec<EvictionCandidate>,
    /// Access count of the least recent row that survives the pass.
    pub threshold: AccessCount,
}

/// Number of rows one pass should drop from `resident` rows.
///
/// Roughly the least recent quarter plus `resident / bias_divisor`, at
/// least one row, and never cutting into the most recent
/// [`MIN_RETAINED_ROWS`] when there are more than that.
pub fn eviction_target(resident: usize, bias_divisor: usize) -> usize {
    if resident == 0 {
        return 0;
    }
    let mut target = resident / 4 + resident / bias_divisor.max(1);
    if target == 0 {
        target = 1;
    }
    if resident > MIN_RETAINED_ROWS {
        target = target.min(resident - MIN_RETAINED_ROWS);
    }
    target
}

/// Picks the least recently accessed rows from a snapshot of the cache.
///
/// Selection is a partial sort on `(last_access, pos)`, so equal counters
/// evict the lower offset first.
pub fn plan_eviction(mut snapshot: Vec<EvictionCandidate>, bias_divisor: usize) -> EvictionPlan {
    let target = eviction_target(snapshot.len(), bias_divisor);
    if target == 0 {
        return EvictionPlan::default();
    }

    let threshold = if target < snapshot.len() {
        snapshot.select_nth_unstable_by_key(target, EvictionCandidate::rank);
        snapshot[target].last_access
    } else {
        snapshot
            .iter()
            .map(|c| c.last_access)
            .max()
            .map_or(0, |max| max.saturating_add(1))
    };

    snapshot.truncate(target);
    snapshot.sort_unstable_by_key(|c| c.pos);
    EvictionPlan {
        victims: snapshot,
        threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DEFAULT_EVICTION_BIAS_DIVISOR;

    fn candidates(accesses: &[(u32, AccessCount)]) -> Vec<EvictionCandidate> {
        accesses
            .iter()
            .enumerate()
            .map(|(i, (pos, access))| EvictionCandidate {
                handle: RowHandle::new(i as u32),
                pos: RowPos::new(*pos),
                last_access: *access,
            })
            .collect()
    }

    #[test]
    fn test_target() {
        assert_eq!(eviction_target(0, 512), 0);
        assert_eq!(eviction_target(1, 512), 1);
        assert_eq!(eviction_target(3, 512), 1);
        assert_eq!(eviction_target(8, 512), 2);
        assert_eq!(eviction_target(24, 512), 6);
        assert_eq!(eviction_target(1024, 512), 258);
        // bias can never push past the retained rows
        assert_eq!(eviction_target(8, 1), 3);
    }

    #[test]
    fn test_picks_least_recent() {
        let snapshot = candidates(&[(800, 9), (160, 2), (480, 7), (320, 1), (640, 5), (96, 8), (32, 3), (900, 4)]);
        let plan = plan_eviction(snapshot, DEFAULT_EVICTION_BIAS_DIVISOR);
        let victims: Vec<u32> = plan.victims.iter().map(|c| c.pos.as_u32()).collect();
        assert_eq!(victims, vec![160, 320]);
        assert_eq!(plan.threshold, 3);
    }

    #[test]
    fn test_ties_evict_lower_offset() {
        let snapshot = candidates(&[(500, 1), (100, 1), (300, 1), (200, 1), (400, 1), (600, 2), (700, 3), (800, 4)]);
        let plan = plan_eviction(snapshot, DEFAULT_EVICTION_BIAS_DIVISOR);
        let victims: Vec<u32> = plan.victims.iter().map(|c| c.pos.as_u32()).collect();
        assert_eq!(victims, vec![100, 200]);
        assert_eq!(plan.threshold, 1);
    }

    #[test]
    fn test_small_cache_evicts_one() {
        let plan = plan_eviction(candidates(&[(32, 4), (64, 2)]), DEFAULT_EVICTION_BIAS_DIVISOR);
        assert_eq!(plan.victims.len(), 1);
        assert_eq!(plan.victims[0].pos, RowPos::new(64));
        assert_eq!(plan.threshold, 4);
    }
}
