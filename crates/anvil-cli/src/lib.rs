// anvil-cli: anvilctl commands, socket client, and display helpers.
// Talks to anvild over the control socket from anvil_core::protocol —
// no direct dependency on the storage/runtime/security crates.

pub mod commands;
pub mod display;
pub mod socket;
pub mod ui;

pub use commands::run;
