#![warn(missing_docs)]

//! # adlib-sandbox
//!
//! Safe execution subsystem for the adlib metaservice.
//!
//! The planning oracle emits a [`plan::Plan`] embedding a short Python
//! snippet; this crate decides whether the snippet may run and then runs it
//! under strict bounds:
//!
//! - **Plan validation**: the oracle's JSON envelope is schema-checked
//!   ([`plan::parse_plan`]); fenced wrapping is tolerated, everything else
//!   is not.
//! - **Allowlist validation**: the snippet is parsed to a syntax tree and
//!   walked node by node ([`ast_check::validate`]); any construct not
//!   explicitly recognized is rejected. No imports, no definitions, no
//!   dynamic evaluation, no broad exception handlers.
//! - **Capability injection**: the interpreter exposes exactly four names,
//!   `store`, `ctx`, `plan`, `make_response`. There is no ambient authority
//!   to find; executed code never holds a file handle, a socket, or a path.
//! - **Bounded execution**: a wall-clock deadline checked at every statement,
//!   a total iteration budget, a reply-size cap, and a concurrency semaphore.
//!
//! The snippet's only stateful capability is the tenant- and
//! collection-scoped store from `adlib-store`, so cross-tenant access is
//! structurally impossible rather than merely checked.

pub mod ast_check;
pub mod audit;
pub mod error;
pub mod executor;
pub mod interp;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod plan;
pub mod redact;
pub mod validator;
pub mod value;

pub use error::SandboxError;
pub use executor::{Harness, HarnessConfig, Reply};
pub use plan::{parse_plan, Action, Plan, PlanError};
