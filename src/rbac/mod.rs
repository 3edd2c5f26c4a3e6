//! Role-based access control.
//!
//! Roles bundle permission strings; assignments bind a role to a user at a
//! [`Scope`]. The [`PermissionEngine`] answers "does this user hold this
//! permission here?" using the wildcard rules in
//! [`gateway_core::permission`].

mod engine;
mod role;
mod store;

pub use engine::{PermissionCheck, PermissionEngine};
pub use role::{Role, RoleAssignment, RoleInput, Scope, builtin_roles};
pub use store::{InMemoryRbacStore, RbacStore};
