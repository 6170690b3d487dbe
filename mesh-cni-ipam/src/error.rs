use ipnetwork::IpNetwork;
use thiserror::Error;

use crate::Family;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid range {range}: {reason}")]
    InvalidRange { range: String, reason: String },

    #[error("range {range} overlaps registered range {existing}")]
    RangeOverlap {
        range: IpNetwork,
        existing: IpNetwork,
    },

    #[error("no {0} range registered")]
    NoRange(Family),

    #[error("subnet {0} is not a host subnet of any registered range")]
    OutOfRange(IpNetwork),

    #[error("subnet {subnet} is already allocated to {owner}")]
    AlreadyAllocated { subnet: IpNetwork, owner: String },

    #[error("subnet {subnet} is not allocated to {owner}")]
    NotOwned { subnet: IpNetwork, owner: String },

    #[error(
        "error allocating subnets for {owner}: {expected} subnets expected, \
         {missing} missing, only {allocated} allocated"
    )]
    Exhausted {
        owner: String,
        expected: usize,
        missing: usize,
        allocated: usize,
    },
}
