use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::{Error, Family, RangePool, Result, SubnetRange};

/// Address families an owner must hold one subnet of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Families {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Families {
    pub const V4: Families = Families {
        ipv4: true,
        ipv6: false,
    };
    pub const V6: Families = Families {
        ipv4: false,
        ipv6: true,
    };
    pub const DUAL_STACK: Families = Families {
        ipv4: true,
        ipv6: true,
    };

    /// Families present in a set of configured ranges.
    pub fn from_ranges(ranges: &[SubnetRange]) -> Self {
        Self {
            ipv4: ranges.iter().any(|r| r.family() == Family::V4),
            ipv6: ranges.iter().any(|r| r.family() == Family::V6),
        }
    }

    pub fn wants(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.ipv4,
            Family::V6 => self.ipv6,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.ipv4 && !self.ipv6
    }

    /// Number of subnets an owner holds once reconciled: one per family.
    pub fn expected(&self) -> usize {
        if self.ipv4 && self.ipv6 { 2 } else { 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Valid existing subnets followed by the newly allocated ones.
    pub subnets: Vec<IpNetwork>,
    /// Subnets reserved by this call. The caller releases these if it fails
    /// to persist `subnets`.
    pub allocated: Vec<IpNetwork>,
}

/// Validates `existing` against `pool` and allocates whatever is missing so
/// `owner` ends up with exactly one subnet per family in `families`.
///
/// Existing subnets of an unwanted family, duplicates of an already kept
/// family, and subnets the pool refuses to mark are released (best effort)
/// and dropped. When the kept subnets already satisfy `families` nothing is
/// allocated. If the pool cannot supply every missing family, all subnets
/// allocated by this call are released before [`Error::Exhausted`] is
/// returned.
pub fn reconcile_subnets(
    pool: &RangePool,
    owner: &str,
    existing: &[IpNetwork],
    families: Families,
) -> Result<Reconciled> {
    let expected = families.expected();
    info!(
        "expected {} subnets on {}, found {}: {:?}",
        expected,
        owner,
        existing.len(),
        existing
    );

    let mut kept: Vec<IpNetwork> = Vec::with_capacity(expected);
    for subnet in existing {
        if kept.contains(subnet) {
            continue;
        }
        let family = Family::of(subnet);
        if families.wants(family) && !kept.iter().any(|k| Family::of(k) == family) {
            match pool.mark_allocated(owner, std::slice::from_ref(subnet)) {
                Ok(()) => {
                    debug!("valid subnet {} allocated on {}", subnet, owner);
                    kept.push(*subnet);
                    continue;
                }
                Err(e) => warn!("subnet {} on {} is not usable: {}", subnet, owner, e),
            }
        }
        info!("releasing unused or invalid subnet {} on {}", subnet, owner);
        if let Err(e) = pool.release(owner, std::slice::from_ref(subnet)) {
            warn!("failed to release subnet {} on {}: {}", subnet, owner, e);
        }
    }

    if kept.len() == expected {
        info!("allowed existing subnets {:?} on {}", kept, owner);
        return Ok(Reconciled {
            subnets: kept,
            allocated: Vec::new(),
        });
    }

    let missing: Vec<Family> = [Family::V4, Family::V6]
        .into_iter()
        .filter(|f| families.wants(*f) && !kept.iter().any(|k| Family::of(k) == *f))
        .collect();

    let mut allocated = Vec::with_capacity(missing.len());
    for family in &missing {
        match pool.allocate(owner, *family) {
            Ok(Some(subnet)) => {
                debug!("allocating subnet {} on {}", subnet, owner);
                allocated.push(subnet);
            }
            Ok(None) => warn!("no free {} subnet for {}", family, owner),
            Err(e) => {
                rollback(pool, owner, &allocated);
                return Err(e);
            }
        }
    }

    if allocated.len() != missing.len() {
        rollback(pool, owner, &allocated);
        return Err(Error::Exhausted {
            owner: owner.to_owned(),
            expected,
            missing: missing.len(),
            allocated: allocated.len(),
        });
    }

    kept.extend_from_slice(&allocated);
    info!("allocated subnets {:?} on {}", kept, owner);
    Ok(Reconciled {
        subnets: kept,
        allocated,
    })
}

fn rollback(pool: &RangePool, owner: &str, allocated: &[IpNetwork]) {
    for subnet in allocated {
        warn!("releasing subnet {} on {}", subnet, owner);
        if let Err(e) = pool.release(owner, std::slice::from_ref(subnet)) {
            warn!("error releasing subnet {} on {}: {}", subnet, owner, e);
        }
    }
}
