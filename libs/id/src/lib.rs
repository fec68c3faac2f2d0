//! # rekon-id
//!
//! Typed identifiers and validated names for the rekon reconciliation core.
//!
//! Two kinds of identity live here:
//!
//! - **IDs** are system-generated, prefixed ULIDs (`inst_01HV4Z4NYPLTRS0JTUA8XDME5F`).
//!   They sort by creation time and cannot be mixed across resource types.
//! - **Names** are user-chosen labels (`mpi`, `gpu-node-0`). They follow
//!   DNS-label rules: lowercase alphanumerics and `-`, starting and ending
//!   with an alphanumeric, at most 63 characters.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{validate_name, MAX_NAME_LEN};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
