use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ipnetwork::IpNetwork;
use tracing::{debug, trace};

use crate::range::AddressRange;
use crate::{Error, Family, Result};

/// Allocator for host subnets out of one or more registered ranges.
///
/// Every operation takes the pool lock for its whole duration, so callers on
/// different tasks observe allocate, mark and release as atomic with respect
/// to one another. A subnet is reserved for at most one owner at a time.
#[derive(Debug, Default)]
pub struct RangePool {
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    ranges: Vec<AddressRange>,
    owners: HashMap<String, Vec<IpNetwork>>,
}

impl RangePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `network` split into `/host_prefix` subnets. Ranges of the
    /// same family may not overlap.
    pub fn add_range(&self, network: IpNetwork, host_prefix: u8) -> Result<()> {
        let range = AddressRange::new(network, host_prefix)?;
        let mut state = self.state();
        if let Some(existing) = state.ranges.iter().find(|r| r.overlaps(&range.network())) {
            return Err(Error::RangeOverlap {
                range: range.network(),
                existing: existing.network(),
            });
        }
        debug!(
            "registered range {} with /{} host subnets",
            range.network(),
            host_prefix
        );
        state.ranges.push(range);
        Ok(())
    }

    pub fn allocate_v4(&self, owner: &str) -> Result<Option<IpNetwork>> {
        self.allocate(owner, Family::V4)
    }

    pub fn allocate_v6(&self, owner: &str) -> Result<Option<IpNetwork>> {
        self.allocate(owner, Family::V6)
    }

    /// Reserves a free subnet of `family` for `owner`.
    ///
    /// Returns `Ok(None)` when every range of the family is fully reserved;
    /// an error is only returned when no range of the family is registered.
    pub fn allocate(&self, owner: &str, family: Family) -> Result<Option<IpNetwork>> {
        let mut state = self.state();
        let PoolState { ranges, owners } = &mut *state;
        let mut registered = false;
        for range in ranges.iter_mut().filter(|r| r.family() == family) {
            registered = true;
            let Some(index) = range.first_free() else {
                continue;
            };
            let subnet = range.subnet_at(index)?;
            range.reserve(index, owner);
            owners.entry(owner.to_owned()).or_default().push(subnet);
            trace!("allocated {} to {}", subnet, owner);
            return Ok(Some(subnet));
        }
        if !registered {
            return Err(Error::NoRange(family));
        }
        Ok(None)
    }

    /// Reserves already known subnets for `owner`. Marking a subnet the owner
    /// already holds is a no-op.
    ///
    /// Every subnet is attempted; the ones that could be reserved stay
    /// reserved and the first failure is returned.
    pub fn mark_allocated(&self, owner: &str, subnets: &[IpNetwork]) -> Result<()> {
        let mut state = self.state();
        let mut failure = None;
        for subnet in subnets {
            if let Err(e) = state.mark(owner, subnet) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Returns `subnets` to the free pool. Subnets not held by `owner` are
    /// left untouched and reported through the first failure.
    pub fn release(&self, owner: &str, subnets: &[IpNetwork]) -> Result<()> {
        let mut state = self.state();
        let mut failure = None;
        for subnet in subnets {
            if let Err(e) = state.release(owner, subnet) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Releases everything `owner` holds and returns what was released.
    pub fn release_all(&self, owner: &str) -> Vec<IpNetwork> {
        let mut state = self.state();
        let Some(held) = state.owners.remove(owner) else {
            return Vec::new();
        };
        for subnet in &held {
            if let Some((range, index)) = state.locate(subnet)
                && state.ranges[range].owner(index) == Some(owner)
            {
                state.ranges[range].free(index);
            }
        }
        held
    }

    /// Subnets currently reserved for `owner`, in reservation order.
    pub fn allocated(&self, owner: &str) -> Vec<IpNetwork> {
        self.state().owners.get(owner).cloned().unwrap_or_default()
    }

    /// Total number of host subnets, free and reserved, as (v4, v6).
    pub fn count(&self) -> (u64, u64) {
        let state = self.state();
        let (mut v4, mut v6) = (0u128, 0u128);
        for range in &state.ranges {
            match range.family() {
                Family::V4 => v4 = v4.saturating_add(range.capacity()),
                Family::V6 => v6 = v6.saturating_add(range.capacity()),
            }
        }
        (saturate(v4), saturate(v6))
    }

    /// Number of reserved host subnets as (v4, v6).
    pub fn usage(&self) -> (u64, u64) {
        let state = self.state();
        let (mut v4, mut v6) = (0u64, 0u64);
        for range in &state.ranges {
            let used = range.used() as u64;
            match range.family() {
                Family::V4 => v4 += used,
                Family::V6 => v6 += used,
            }
        }
        (v4, v6)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PoolState {
    fn locate(&self, subnet: &IpNetwork) -> Option<(usize, u128)> {
        self.ranges
            .iter()
            .enumerate()
            .find_map(|(i, range)| range.index_of(subnet).map(|index| (i, index)))
    }

    fn mark(&mut self, owner: &str, subnet: &IpNetwork) -> Result<()> {
        let (range, index) = self.locate(subnet).ok_or(Error::OutOfRange(*subnet))?;
        match self.ranges[range].owner(index) {
            Some(current) if current == owner => Ok(()),
            Some(current) => Err(Error::AlreadyAllocated {
                subnet: *subnet,
                owner: current.to_owned(),
            }),
            None => {
                self.ranges[range].reserve(index, owner);
                self.owners
                    .entry(owner.to_owned())
                    .or_default()
                    .push(*subnet);
                Ok(())
            }
        }
    }

    fn release(&mut self, owner: &str, subnet: &IpNetwork) -> Result<()> {
        let (range, index) = self.locate(subnet).ok_or(Error::OutOfRange(*subnet))?;
        if self.ranges[range].owner(index) != Some(owner) {
            return Err(Error::NotOwned {
                subnet: *subnet,
                owner: owner.to_owned(),
            });
        }
        self.ranges[range].free(index);
        if let Some(held) = self.owners.get_mut(owner) {
            held.retain(|s| s != subnet);
            if held.is_empty() {
                self.owners.remove(owner);
            }
        }
        Ok(())
    }
}

fn saturate(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().expect("valid network")
    }

    fn pool(ranges: &[(&str, u8)]) -> RangePool {
        let pool = RangePool::new();
        for (cidr, host_prefix) in ranges {
            pool.add_range(net(cidr), *host_prefix).expect("add range");
        }
        pool
    }

    #[test]
    fn allocates_releases_and_reuses() {
        let pool = pool(&[("10.130.0.0/23", 24)]);

        assert_eq!(pool.allocate_v4("a").unwrap(), Some(net("10.130.0.0/24")));
        assert_eq!(pool.allocate_v4("b").unwrap(), Some(net("10.130.1.0/24")));
        assert_eq!(pool.allocate_v4("c").unwrap(), None);
        assert_eq!(pool.usage(), (2, 0));

        assert_eq!(pool.release_all("a"), vec![net("10.130.0.0/24")]);
        assert_eq!(pool.allocate_v4("d").unwrap(), Some(net("10.130.0.0/24")));
        assert_eq!(pool.allocated("d"), vec![net("10.130.0.0/24")]);
        assert!(pool.allocated("a").is_empty());
    }

    #[test]
    fn allocate_without_family_range_is_an_error() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        assert_eq!(pool.allocate_v6("a"), Err(Error::NoRange(Family::V6)));
        assert_eq!(pool.usage(), (0, 0));
    }

    #[test]
    fn allocation_spills_into_next_range() {
        let pool = pool(&[("10.0.0.0/24", 24), ("10.1.0.0/24", 24)]);
        assert_eq!(pool.allocate_v4("a").unwrap(), Some(net("10.0.0.0/24")));
        assert_eq!(pool.allocate_v4("b").unwrap(), Some(net("10.1.0.0/24")));
        assert_eq!(pool.allocate_v4("c").unwrap(), None);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let pool = pool(&[("10.128.0.0/14", 23)]);
        let err = pool.add_range(net("10.129.0.0/16"), 24).unwrap_err();
        assert_eq!(
            err,
            Error::RangeOverlap {
                range: net("10.129.0.0/16"),
                existing: net("10.128.0.0/14"),
            }
        );
        // a different family never overlaps
        pool.add_range(net("fd00:10:128::/48"), 64).expect("v6 range");
        assert!(pool.add_range(net("10.0.0.0/8"), 24).is_err());
    }

    #[test]
    fn count_and_usage_are_per_family() {
        let pool = pool(&[("10.128.0.0/14", 23), ("fd00:10:128::/48", 64)]);
        assert_eq!(pool.count(), (512, 65536));

        pool.allocate_v4("a").unwrap();
        pool.allocate_v6("a").unwrap();
        pool.allocate_v6("b").unwrap();
        assert_eq!(pool.usage(), (1, 2));
        assert_eq!(pool.count(), (512, 65536));
    }

    #[test]
    fn count_saturates_for_huge_v6_ranges() {
        let pool = pool(&[("fd00::/8", 128)]);
        assert_eq!(pool.count(), (0, u64::MAX));
    }

    #[test]
    fn mark_allocated_is_idempotent_per_owner() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        pool.mark_allocated("a", &[net("10.130.1.0/24")]).unwrap();
        pool.mark_allocated("a", &[net("10.130.1.0/24")]).unwrap();
        assert_eq!(pool.allocated("a"), vec![net("10.130.1.0/24")]);
        assert_eq!(pool.usage(), (1, 0));

        // first fit skips the marked subnet
        assert_eq!(pool.allocate_v4("b").unwrap(), Some(net("10.130.0.0/24")));
    }

    #[test]
    fn mark_allocated_reports_conflicts_but_keeps_partial_success() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        pool.mark_allocated("a", &[net("10.130.0.0/24")]).unwrap();

        let err = pool
            .mark_allocated(
                "b",
                &[
                    net("10.130.0.0/24"),
                    net("10.130.1.0/24"),
                    net("192.168.0.0/24"),
                ],
            )
            .unwrap_err();
        assert_eq!(
            err,
            Error::AlreadyAllocated {
                subnet: net("10.130.0.0/24"),
                owner: "a".into(),
            }
        );
        assert_eq!(pool.allocated("b"), vec![net("10.130.1.0/24")]);
        assert_eq!(pool.allocated("a"), vec![net("10.130.0.0/24")]);
    }

    #[test]
    fn mark_rejects_subnets_of_the_wrong_size() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        assert_eq!(
            pool.mark_allocated("a", &[net("10.130.0.0/25")]),
            Err(Error::OutOfRange(net("10.130.0.0/25")))
        );
    }

    #[test]
    fn release_requires_ownership() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        let subnet = pool.allocate_v4("a").unwrap().expect("subnet");

        assert_eq!(
            pool.release("b", &[subnet]),
            Err(Error::NotOwned {
                subnet,
                owner: "b".into(),
            })
        );
        assert_eq!(pool.usage(), (1, 0));

        pool.release("a", &[subnet]).unwrap();
        assert_eq!(pool.usage(), (0, 0));
        assert!(pool.allocated("a").is_empty());
        assert!(pool.release("a", &[subnet]).is_err());
    }

    #[test]
    fn release_all_for_unknown_owner_is_a_noop() {
        let pool = pool(&[("10.130.0.0/23", 24)]);
        pool.allocate_v4("a").unwrap();
        assert!(pool.release_all("ghost").is_empty());
        assert_eq!(pool.usage(), (1, 0));
    }

    #[test]
    fn concurrent_allocations_never_share_a_subnet() {
        let pool = Arc::new(pool(&[("10.0.0.0/20", 24)]));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.allocate_v4(&format!("node-{i}")).unwrap())
            })
            .collect();
        let mut subnets: Vec<IpNetwork> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("thread"))
            .collect();
        assert_eq!(subnets.len(), 16);
        subnets.sort_by_key(|s| s.to_string());
        subnets.dedup();
        assert_eq!(subnets.len(), 16);
        assert_eq!(pool.usage(), (16, 0));
    }
}
