//! Background reconciler loops that keep the store's view of the world
//! honest: instance expiry, VM orphan reconciliation, node heartbeats,
//! upload-session GC, rate-limiter/abuse-tracker janitors, and stale
//! DHCP reservation sweeps.

pub mod supervisor;

pub use supervisor::Supervisor;
