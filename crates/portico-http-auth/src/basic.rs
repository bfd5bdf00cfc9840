//! HTTP Basic Authentication parsing (RFC 7617)
//!
//! Credentials arrive as `username:password` base64-encoded in the
//! Authorization header:
//!
//! ```text
//! Authorization: Basic <base64(username:password)>
//! ```

use base64::Engine;

/// Credentials decoded from a Basic Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Decode an Authorization header value. Returns `None` for a different
    /// scheme, bad base64, or a payload without a `:` separator.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        let scheme = value.get(..6)?;
        if !scheme.eq_ignore_ascii_case("basic ") {
            return None;
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(value[6..].trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;

        let (username, password) = decoded.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Compare against the expected pair.
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}
