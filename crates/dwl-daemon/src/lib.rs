//! dwl-daemon library target.
//!
//! Exposes the typed service facade for integration tests and for the
//! (external) HTTP layer. The binary `main.rs` depends on this library
//! target.

pub mod service;
