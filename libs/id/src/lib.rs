//! # convoy-id
//!
//! Typed identifiers for the convoy control plane.
//!
//! ## Two kinds of ID
//!
//! - **Generated IDs** are minted by the system and use a prefixed ULID:
//!   `{prefix}_{ulid}`, e.g. `inst_01HV4Z4NYPLTRS0JTUA8XDME5F`. The instance
//!   ID doubles as the assignment key and the container name.
//! - **Names** are chosen by operators (hosts, services, resource pools).
//!   They are opaque strings, but every one of them becomes a path segment in
//!   the coordination namespace, so they are validated on construction.
//!
//! Both kinds are typed so a `HostId` can never be passed where a `ServiceId`
//! is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::{parse_prefixed, validate_name, MAX_NAME_LEN};
pub use types::*;

/// Used by the expansion of [`define_id!`].
pub use ulid::Ulid;
