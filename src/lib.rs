//! Capacity compensation admission webhook
//!
//! Steers new Deployment replicas towards on-demand or spot nodes so that a
//! configured number of replicas stays on guaranteed capacity.

pub mod affinity;
pub mod capacity;
pub mod cluster;
pub mod compensator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod patch;
pub mod policy;
pub mod server;
pub mod strategy;

pub use compensator::{Compensator, PodAdmission, Verdict};
pub use config::CompensationConfig;
pub use error::{Error, Result};
