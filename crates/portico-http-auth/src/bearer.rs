//! Bearer-token extraction for the administrative API
//!
//! Tokens are opaque random strings. Clients may supply them either as an
//! `access_token` query parameter or in an `Authorization: Bearer` header;
//! the query parameter wins when both are present.

/// Pull the access token out of a request's query parameter and/or
/// Authorization header value.
pub fn extract_access_token(
    query_token: Option<&str>,
    authorization: Option<&str>,
) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    authorization?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}
