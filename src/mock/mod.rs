//! Mock Cloud Implementation
//!
//! In-process implementation of every cloud service trait for tests.
//!
//! # Capabilities
//!
//! - Call counting per [`crate::cloud::CloudOp`]
//! - Failure injection (errors, delays, fail-N-times-then-succeed)
//! - Create races (another writer wins between get and create)
//! - Scripted build progressions, one frame per poll
//! - Region rules for bucket creation

mod cloud;
mod failure;

pub use cloud::{phase, BuildScript, MockBucket, MockCloud, MockRole};
pub use failure::{FailureConfig, FailureInjector};
