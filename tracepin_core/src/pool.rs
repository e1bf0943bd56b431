//! Executable memory in the target that hosts trampolines.
//!
//! Trampolines are bump-allocated out of pools. A pool is one reservation in
//! the target; pools are never shrunk, merged or released, and space handed
//! out is never reused even after the tracker that owned it is removed.

use crate::config::PoolSettings;
use crate::error::HookError;
use crate::target::{Address, ProcessMemory, RegionState};
use log::{debug, warn};

/// Stable index of a pool within its [`PoolSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PoolId(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub base: Address,
    pub size: u64,
    /// Next free byte.
    pub cursor: Address,
}

impl Pool {
    fn new(base: Address, size: u64) -> Self {
        Self {
            base,
            size,
            cursor: base,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.base + self.size - self.cursor
    }

    pub fn has_room(&self, required: u64) -> bool {
        self.remaining() >= required
    }

    /// Whether the next trampoline carved from this pool is within `distance` of `address`.
    pub fn is_near(&self, address: Address, distance: u64) -> bool {
        self.cursor.abs_diff(address) < distance
    }
}

/// Result of trying to place a pool at one probed address.
enum Placement {
    Placed(Pool),
    /// Too small, or the allocation failed. Keep probing.
    Skipped,
    /// The allocation landed out of reach and was given back. Stop probing.
    Misplaced,
}

fn align_down(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_next_multiple_of(alignment)
}

#[derive(Debug, Default)]
pub struct PoolSet {
    pools: Vec<Pool>,
}

impl PoolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PoolId) -> Option<&Pool> {
        self.pools.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolId, &Pool)> {
        self.pools.iter().enumerate().map(|(i, pool)| (PoolId(i), pool))
    }

    /// Consumes `len` bytes at the pool's cursor. Call only once the trampoline is written.
    pub fn bump(&mut self, id: PoolId, len: u64) {
        if let Some(pool) = self.pools.get_mut(id.0) {
            pool.cursor = (pool.cursor + len).min(pool.base + pool.size);
        }
    }

    fn push(&mut self, pool: Pool) -> PoolId {
        debug!(
            "New trampoline pool at {:#x} ({} bytes)",
            pool.base, pool.size
        );
        self.pools.push(pool);
        PoolId(self.pools.len() - 1)
    }

    /// Returns a pool with `required` bytes free, as close to `near` as possible.
    ///
    /// Existing pools within `distance` win. Otherwise a new pool is placed in
    /// the nearest free region around `near`. Failing that, any pool with room
    /// is used, and as a last resort a fixed-size pool is allocated anywhere.
    pub fn find_or_create(
        &mut self,
        process: &dyn ProcessMemory,
        near: Address,
        required: u64,
        distance: u64,
        settings: &PoolSettings,
    ) -> Result<PoolId, HookError> {
        let mut fallback = None;
        for (id, pool) in self.iter() {
            if !pool.has_room(required) {
                continue;
            }
            if pool.is_near(near, distance) {
                return Ok(id);
            }
            fallback.get_or_insert(id);
        }

        if let Some(pool) = Self::allocate_near(process, near, distance, settings) {
            return Ok(self.push(pool));
        }
        if let Some(id) = fallback {
            return Ok(id);
        }

        let size = settings.far_pool_size.max(required);
        match process.alloc_executable(None, size) {
            Ok(base) => Ok(self.push(Pool::new(base, size))),
            Err(e) => {
                warn!("Failed to allocate a {size}-byte trampoline pool: {e}");
                Err(HookError::PoolExhausted)
            }
        }
    }

    /// Probes free regions alternately below and above `near`, one
    /// allocation-granularity step at a time, within `distance` of it.
    fn allocate_near(
        process: &dyn ProcessMemory,
        near: Address,
        distance: u64,
        settings: &PoolSettings,
    ) -> Option<Pool> {
        let granularity = process.allocation_granularity();
        let (min, max) = process.address_range();
        let low = near.saturating_sub(distance).max(min);
        let high = near.saturating_add(distance).min(max);

        let origin = align_down(near, granularity);
        let mut backward = origin.checked_sub(granularity);
        let mut forward = origin.checked_add(granularity);

        while backward.is_some() || forward.is_some() {
            if let Some(from) = backward {
                backward = None;
                if let Some(at) = Self::prev_free(process, from, low, granularity) {
                    match Self::place(process, at, near, distance, settings) {
                        Placement::Placed(pool) => return Some(pool),
                        Placement::Misplaced => return None,
                        Placement::Skipped => backward = at.checked_sub(granularity),
                    }
                }
            }
            if let Some(from) = forward {
                forward = None;
                if let Some(at) = Self::next_free(process, from, high, granularity) {
                    match Self::place(process, at, near, distance, settings) {
                        Placement::Placed(pool) => return Some(pool),
                        Placement::Misplaced => return None,
                        Placement::Skipped => forward = at.checked_add(granularity),
                    }
                }
            }
        }
        None
    }

    /// First free, granularity-aligned address at or below `from`, not below `low`.
    fn prev_free(
        process: &dyn ProcessMemory,
        from: Address,
        low: Address,
        granularity: u64,
    ) -> Option<Address> {
        let mut at = align_down(from, granularity);
        while at >= low {
            let region = process.query_region(at)?;
            if region.state == RegionState::Free {
                return Some(at);
            }
            if region.allocation_base < granularity {
                return None;
            }
            at = align_down(region.allocation_base, granularity).checked_sub(granularity)?;
        }
        None
    }

    /// First free, granularity-aligned address at or above `from`, not above `high`.
    fn next_free(
        process: &dyn ProcessMemory,
        from: Address,
        high: Address,
        granularity: u64,
    ) -> Option<Address> {
        let mut at = align_up(from, granularity)?;
        while at <= high {
            let region = process.query_region(at)?;
            if region.state == RegionState::Free {
                return Some(at);
            }
            at = align_up(region.base.checked_add(region.size)?, granularity)?;
        }
        None
    }

    fn place(
        process: &dyn ProcessMemory,
        at: Address,
        near: Address,
        distance: u64,
        settings: &PoolSettings,
    ) -> Placement {
        let Some(region) = process.query_region(at) else {
            return Placement::Skipped;
        };
        let available = (region.base + region.size).saturating_sub(at);
        if available < settings.min_region_size {
            return Placement::Skipped;
        }
        let size = available.min(settings.far_pool_size);
        let base = match process.alloc_executable(Some(at), size) {
            Ok(base) => base,
            Err(e) => {
                debug!("Pool allocation at {at:#x} failed: {e}");
                return Placement::Skipped;
            }
        };
        let pool = Pool::new(base, size);
        if pool.is_near(near, distance) {
            return Placement::Placed(pool);
        }
        warn!("Pool allocated at {base:#x} is out of reach of {near:#x}; releasing it");
        if let Err(e) = process.free(base) {
            warn!("Failed to release pool at {base:#x}: {e}");
        }
        Placement::Misplaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Protection, SimulatedTarget};
    use crate::target::TargetAccess;
    use crate::trampoline::{NEAR_THRESHOLD, TRAMPOLINE_MAX_LEN};

    const PID: u32 = 7;
    const CODE: Address = 0x1_4000_0000;
    const REQUIRED: u64 = TRAMPOLINE_MAX_LEN as u64;

    fn setup() -> (SimulatedTarget, Box<dyn ProcessMemory>) {
        let sim = SimulatedTarget::new();
        sim.spawn(PID);
        sim.map(PID, CODE, 0x10000, Protection::ReadExecute).unwrap();
        let handle = sim.open(PID).unwrap();
        (sim, handle)
    }

    #[test]
    fn new_pool_lands_just_below_target() {
        let (_sim, handle) = setup();
        let mut pools = PoolSet::new();
        let settings = PoolSettings::default();
        let id = pools
            .find_or_create(handle.as_ref(), CODE + 0x100, REQUIRED, NEAR_THRESHOLD, &settings)
            .unwrap();
        let pool = pools.get(id).unwrap();
        assert_eq!(pool.base, CODE - 0x10000);
        assert_eq!(pool.size, settings.far_pool_size);
        assert!(pool.is_near(CODE, NEAR_THRESHOLD));
    }

    #[test]
    fn probing_skips_reservations_on_both_sides() {
        let (sim, handle) = setup();
        sim.reserve(PID, CODE - 0x10000, 0x10000).unwrap();
        sim.reserve(PID, CODE - 0x20000, 0x10000).unwrap();
        sim.reserve(PID, CODE + 0x10000, 0x10000).unwrap();
        let mut pools = PoolSet::new();
        let id = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &PoolSettings::default())
            .unwrap();
        // Backward probing walks past both reservations below the code.
        assert_eq!(pools.get(id).unwrap().base, CODE - 0x30000);
    }

    #[test]
    fn existing_near_pool_is_reused() {
        let (_sim, handle) = setup();
        let mut pools = PoolSet::new();
        let settings = PoolSettings::default();
        let first = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &settings)
            .unwrap();
        pools.bump(first, REQUIRED);
        let second = pools
            .find_or_create(handle.as_ref(), CODE + 0x20, REQUIRED, NEAR_THRESHOLD, &settings)
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools.get(first).unwrap().remaining(), settings.far_pool_size - REQUIRED);
    }

    #[test]
    fn near_pool_preferred_over_earlier_far_pool() {
        let (_sim, handle) = setup();
        let mut pools = PoolSet::new();
        let far = pools.push(Pool::new(0x10000, 0x10000));
        let near = pools.push(Pool::new(CODE + 0x10000, 0x10000));
        let settings = PoolSettings::default();
        let chosen = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &settings)
            .unwrap();
        assert_eq!(chosen, near);
        assert_ne!(chosen, far);
    }

    #[test]
    fn full_pool_is_never_chosen() {
        let (_sim, handle) = setup();
        let mut pools = PoolSet::new();
        let full = pools.push(Pool::new(CODE + 0x10000, REQUIRED));
        pools.bump(full, 1);
        let chosen = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &PoolSettings::default())
            .unwrap();
        assert_ne!(chosen, full);
        assert_eq!(pools.len(), 2);
    }

    #[test]
    fn misplaced_allocation_is_released_and_far_pool_used() {
        let (sim, handle) = setup();
        let mut pools = PoolSet::new();
        let far = pools.push(Pool::new(0x10000, 0x10000));
        // Every hinted allocation lands far away instead.
        sim.set_displaced_allocations(Some(0x7000_0000_0000));

        let chosen = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &PoolSettings::default())
            .unwrap();

        assert_eq!(chosen, far);
        assert!(!sim.region_bases(PID).contains(&0x7000_0000_0000));
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn falls_back_to_anywhere_when_window_is_full() {
        let sim = SimulatedTarget::with_layout(0x10000, 0x10000, 0x2F_FFFF);
        sim.spawn(PID);
        sim.map(PID, 0x10000, 0x2F0000, Protection::ReadExecute).unwrap();
        let handle = sim.open(PID).unwrap();
        let mut pools = PoolSet::new();
        let result = pools.find_or_create(
            handle.as_ref(),
            0x20000,
            REQUIRED,
            NEAR_THRESHOLD,
            &PoolSettings::default(),
        );
        assert_eq!(result, Err(HookError::PoolExhausted));
        assert!(pools.is_empty());
    }

    #[test]
    fn small_free_gaps_are_skipped() {
        let (_sim, handle) = setup();
        let settings = PoolSettings {
            min_region_size: 0x20000,
            ..PoolSettings::default()
        };
        let mut pools = PoolSet::new();
        let id = pools
            .find_or_create(handle.as_ref(), CODE, REQUIRED, NEAR_THRESHOLD, &settings)
            .unwrap();
        // Only 64 KiB is free between the first backward probe and the code.
        assert_eq!(pools.get(id).unwrap().base, CODE + 0x10000);
    }
}
