//! HTTP authentication primitives
//!
//! Framework-free parsing for the two credential forms the proxy accepts:
//! Basic credentials on proxied requests and opaque bearer tokens on the
//! administrative API.

pub mod basic;
pub mod bearer;

pub use basic::BasicCredentials;
pub use bearer::extract_access_token;
