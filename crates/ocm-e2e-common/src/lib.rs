//! Core of the OCM e2e harness: resource access, condition predicates and
//! the reconciliation wait engine

#![deny(missing_docs)]

pub mod accessor;
pub mod conditions;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod scheme;
pub mod telemetry;
pub mod wait;
pub mod yaml;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Pause between two ticks of a wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One minute: controller reconciles of a single object
pub const TIMEOUT_SHORT: Duration = Duration::from_secs(60);

/// Two minutes: reconciles that fetch from the registry or git server
pub const TIMEOUT_MEDIUM: Duration = Duration::from_secs(120);

/// Five minutes: deployments pulling images on a fresh cluster
pub const TIMEOUT_LONG: Duration = Duration::from_secs(300);

/// Timeout of a wait request that does not set one
pub const DEFAULT_WAIT_TIMEOUT: Duration = TIMEOUT_MEDIUM;

/// Namespace the OCM controllers and test objects live in by default
pub const DEFAULT_NAMESPACE: &str = "ocm-system";

/// Namespace Flux is installed into
pub const FLUX_NAMESPACE: &str = "flux-system";
