//! Runvoy: run shell commands in short-lived, isolated containers.
//!
//! Users authenticate with an API key, submit a command together with an image
//! reference and a list of secret names, and the orchestrator provisions one
//! container per execution. Every request is checked against a role-based policy
//! table twice: once at the boundary (may this role list or manage the resource
//! type?) and once per referenced resource (may this role *use* this image and
//! these secrets?). Compute is only provisioned after both checks pass.
//!
//! See `DESIGN.md` for the module map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;

pub mod authorization;
pub mod catalog;
pub mod execution;
pub mod identity;

pub mod providers;
pub mod store;

pub mod api;
pub mod app;

pub use error::{Error, ErrorKind, Result};
