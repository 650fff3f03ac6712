//! agent-launch - build and deploy a containerised agent
//!
//! Packages an agent's source directory, provisions the cloud resources a
//! remote container build needs, runs and monitors that build, and creates
//! or updates the managed runtime that serves the resulting image.

pub mod build;
pub mod bundle;
pub mod cloud;
pub mod config;
pub mod deploy;
pub mod error;
pub mod mock;
pub mod monitor;
pub mod pipeline;
pub mod provision;
pub mod report;
pub mod signal;
pub mod state;
pub mod timeout;

pub use cloud::{CloudContext, CloudError, RetryPolicy};
pub use config::{EffectiveConfig, LaunchConfig};
pub use error::{LaunchError, LaunchResult};
pub use pipeline::{BuildMode, LaunchOutcome, LaunchRequest, Launcher};
pub use report::LaunchReport;
