//! HTTP header names and helpers shared by the evaluator.

/// Signed identity assertion forwarded to the upstream.
pub const HEADER_JWT_ASSERTION: &str = "X-Pomerium-Jwt-Assertion";

/// Relayed identity assertion for upstream-to-upstream hops.
pub const HEADER_JWT_ASSERTION_FOR: &str = "X-Pomerium-Jwt-Assertion-For";

/// Standard authorization header (serverless upstream authentication).
pub const HEADER_AUTHORIZATION: &str = "Authorization";

/// Internal endpoint serving the WebAuthn ceremony.
pub const WEBAUTHN_PATH: &str = "/.pomerium/webauthn";

/// Internal endpoint returning the caller's identity assertion.
pub const JWT_PATH: &str = "/.pomerium/jwt";

/// Canonicalize a header name the way the proxy layer emits them:
/// the first letter and every letter after a hyphen upper-cased, everything
/// else lower-cased (`x-pomerium-jwt-assertion` → `X-Pomerium-Jwt-Assertion`).
///
/// Names containing characters outside the token set are returned unchanged.
#[must_use]
pub fn canonical_header_key(name: &str) -> String {
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
    {
        return name.to_owned();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}
