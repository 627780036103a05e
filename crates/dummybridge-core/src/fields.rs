//! Submitted login field payloads

use std::collections::HashMap;

/// Flat field name to value mapping collected from a login page or form
pub type LoginFields = HashMap<String, String>;

/// Field carrying the remote identity; used as the login ID
pub const USERNAME_FIELD: &str = "username";

/// Secret field; anything goes
pub const PASSWORD_FIELD: &str = "password";

/// Non-empty value of the identity field, if present
pub fn identity(fields: &LoginFields) -> Option<&str> {
    fields
        .get(USERNAME_FIELD)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}
