#![warn(missing_docs)]

//! # jsbox
//!
//! Host-side client for evaluating untrusted JavaScript in isolates hosted by
//! a separate helper process (`jsbox-worker`).
//!
//! A [`Sandbox`] binds the helper and negotiates a [`FeatureSet`]. Each
//! [`Isolate`] created from it is an independent realm; [`Isolate::evaluate`]
//! returns an [`Evaluation`] future resolving to the completion value as a
//! string, or to one of the failure kinds in [`SandboxError`].
//!
//! ## Failure model
//!
//! - **Evaluation failure**: the script threw; the isolate stays usable
//! - **Memory limit exceeded**: this evaluation blew the isolate's heap cap
//! - **Isolate terminated**: the isolate is gone; bystanders get this
//! - **Sandbox dead**: the helper is gone; supersedes everything else
//!
//! Operations on closed objects, a second concurrent binding, and use of
//! features the helper did not advertise are programmer errors, returned
//! synchronously.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod host;
pub mod ipc;
pub mod isolate;
pub mod params;
pub mod sandbox;
pub mod transport;

pub use config::SandboxConfig;
pub use error::SandboxError;
pub use evaluation::{Evaluation, Outcome};
pub use features::{Feature, FeatureSet};
pub use isolate::Isolate;
pub use params::IsolateStartupParameters;
pub use sandbox::Sandbox;
