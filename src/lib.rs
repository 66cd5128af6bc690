//! Shunt - a split-horizon DNS forwarder.
//!
//! Queries race against two upstream pools: trusted resolvers whose answers
//! are believed untampered but geographically distant, and untrusted
//! in-region resolvers whose answers are optimal but may be forged. The
//! decision engine cross-validates replies against a region CIDR set and
//! blacklists and returns whichever reply the policy favors.

pub mod client;
pub mod config;
pub mod filter;
pub mod hosts;
pub mod probe;
pub mod proxy;
pub mod race;
pub mod resolver;
pub mod transport;
pub mod upstream;
