//! Integration tests module
//!
//! End-to-end flows across the registries and the orchestrator:
//! - node registration through wallet activation
//! - signing request lifecycle

pub mod custody_flow_test;
pub mod signing_flow_test;
