//! OCM e2e - end-to-end harness for the OCM controllers
//!
//! Brings up a kind cluster with Flux, a Gitea server and an in-cluster OCI
//! registry, then runs features whose assess steps poll the cluster until
//! the controllers under test have reconciled.
//!
//! # Modules
//!
//! - [`config`] - Environment-driven configuration
//! - [`environment`] - Ordered setup and finish of the shared test environment
//! - [`harness`] - Features, steps and the step context
//! - [`steps`] - Reusable setup, assess and teardown steps
//! - [`kind`] - kind cluster lifecycle
//! - [`flux`] - Flux install and GitOps sync objects
//! - [`gitea`] - Gitea install and API client
//! - [`oci`] - Component versions and pushing them into the registry
//! - [`port_forward`] - Local tunnel to the in-cluster registry
//! - [`signing`] - RSA signing of component descriptors
//!
//! The polling engine itself lives in [`ocm_e2e_common`].

#![deny(missing_docs)]

pub mod config;
pub mod environment;
pub mod flux;
pub mod gitea;
pub mod harness;
pub mod kind;
pub mod oci;
pub mod port_forward;
pub mod signing;
pub mod steps;

pub use ocm_e2e_common::{Error, Result};
