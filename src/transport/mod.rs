//! Listening front end.
//!
//! UDP and TCP listeners accept client queries, hand each one to the
//! decision engine on its own task, and write back whatever reply the
//! engine settles on. A panicking handler is logged and answers nothing;
//! it never takes the process down.

pub mod tcp;
pub mod udp;

/// Maximum size of a DNS packet we accept from clients (with headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;
