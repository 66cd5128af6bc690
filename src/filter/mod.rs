//! Match sets driving the accept/reject policy.
//!
//! Two shapes: suffix sets over domain names (the domain blacklist and the
//! polluted-domain list) and prefix sets over IP addresses (the region set
//! and the IP blacklist). All are built during startup and never mutated
//! afterwards, so concurrent readers need no synchronization.

mod domain_set;
mod ip_set;

pub use domain_set::DomainSet;
pub use ip_set::IpSet;
