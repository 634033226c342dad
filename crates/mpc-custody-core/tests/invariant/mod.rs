//! Invariant tests module
//!
//! Properties that must hold for every input:
//! - threshold bounds on wallet configuration
//! - address derivation determinism
//! - request state machine terminality

pub mod custody_invariant;
