mod error;
mod pool;
mod range;
mod reconcile;

use std::fmt::Display;

use ipnetwork::IpNetwork;

pub use error::Error;
pub use pool::RangePool;
pub use range::{DEFAULT_V4_HOST_PREFIX, DEFAULT_V6_HOST_PREFIX, SubnetRange};
pub use reconcile::{Families, Reconciled, reconcile_subnets};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => Family::V4,
            IpNetwork::V6(_) => Family::V6,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Family::V4 => "ipv4",
            Family::V6 => "ipv6",
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
