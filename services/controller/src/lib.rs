//! rekon controller library.
//!
//! This crate ships the `rekond` daemon, but the components are exposed as a
//! library so that `rekonctl` can share the store and document types, and so
//! the reconciliation scenarios can be driven from integration tests.
//!
//! Components, leaves first:
//! - [`store`]: durable desired state, one record per spec
//! - [`collector`]: observed state of every instance, kept by runtime events
//!   and periodic relists
//! - [`placement`]: node selection with per-node capacity accounting
//! - [`volumes`]: host-path resolution for the chosen node
//! - [`reconciler`]: one level-triggered pass per spec
//! - [`worker`]: the per-spec loops and their triggers

pub mod collector;
pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod model;
pub mod placement;
pub mod reconciler;
pub mod runtime;
pub mod store;
pub mod volumes;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ControllerError, ControllerResult, ValidationError};
