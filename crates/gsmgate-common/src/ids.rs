//! Prefixed ID generation.
//!
//! IDs use a `prefix_` followed by a UUIDv7 (time-ordered), so they are
//! globally unique and identifiable by type when reading logs.

use uuid::Uuid;

/// Generate a prefixed ID using UUIDv7.
fn prefixed_id(prefix: &str) -> String {
    let id = Uuid::now_v7();
    format!("{}_{}", prefix, id.as_simple())
}

/// Generate a signaling call ID: `call_<uuid7>`
pub fn call_id() -> String {
    prefixed_id("call")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_have_prefix() {
        assert!(call_id().starts_with("call_"));
    }

    #[test]
    fn call_ids_are_unique() {
        let a = call_id();
        let b = call_id();
        assert_ne!(a, b);
    }
}
