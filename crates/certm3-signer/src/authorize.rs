//! Group authorisation policy.
//!
//! The client's claimed group list travels opaquely from the browser
//! through the gateway to this daemon; authorisation happens here, against
//! the registry's ground truth, and nowhere earlier. The issued set is
//! `(requested ∩ actual) ∪ {username, "users"}`: membership the user both
//! asked for and holds, plus the two baseline groups every certificate
//! carries. When the registry cannot be reached the caller passes an empty
//! `actual`: baseline identity is always issuable, elevated authority is
//! not.

use std::collections::BTreeSet;

/// The well-known group every enrolled user belongs to.
pub const USERS_GROUP: &str = "users";

/// Computes the authorised group set for a certificate.
///
/// Duplicates collapse; iteration order is the `BTreeSet` order and carries
/// no meaning.
pub fn authorized_groups(
    username: &str,
    requested: &[String],
    actual: &[String],
) -> BTreeSet<String> {
    let actual: BTreeSet<&str> = actual.iter().map(String::as_str).collect();

    let mut authorized: BTreeSet<String> = requested
        .iter()
        .filter(|group| actual.contains(group.as_str()))
        .cloned()
        .collect();
    authorized.insert(username.to_string());
    authorized.insert(USERS_GROUP.to_string());
    authorized
}
