//! Facade crate re-exporting the daemon's own modules so integration
//! tests and the `anvild` binary share one crate root.

pub mod dispatch;
pub mod identity;
pub mod observability;
