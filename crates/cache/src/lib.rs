//! Staleness-bounded caches for session credentials and policies.

pub mod credentials;
pub mod policy;
pub mod staleness;

pub use credentials::CredentialCache;
pub use policy::{fetch_policies, parse_policies, Operation, Policy, PolicyStore};
pub use staleness::{
    CacheError, CacheKey, CacheResult, Clock, Lookup, ManualClock, StalenessCache, SystemClock,
};
