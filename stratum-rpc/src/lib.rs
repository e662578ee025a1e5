//! Client engine for the Electrum flavour of Stratum JSON-RPC.
//!
//! The engine itself lives in [`rpc`]. Around it sit the pieces an
//! application needs to reach a real server: [`server`] descriptors, the
//! [`legacy`] address-method rewrite, and [`tracing`] setup for binaries.

pub mod legacy;
pub mod rpc;
pub mod server;
pub mod tracing;
