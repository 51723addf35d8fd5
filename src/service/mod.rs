//! Service layer
//!
//! Contains business logic separated from HTTP handlers and the CLI.
//! Services orchestrate database and federation operations.

mod group;

pub use group::GroupService;
