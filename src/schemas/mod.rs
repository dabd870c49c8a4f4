//! Domain Schemas
//!
//! Subscriptions (sources to poll), items (discovered content) and the
//! transient outcome of a fetch attempt. All structs use
//! `serde(rename_all = "camelCase")` for JSON output.

pub mod item;
pub mod outcome;
pub mod subscription;

pub use item::*;
pub use outcome::*;
pub use subscription::*;
