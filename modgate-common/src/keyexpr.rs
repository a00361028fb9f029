//! Key expression helpers for bridge endpoints.
//!
//! Bridge endpoints are plain key-expression prefixes. Frames travel one
//! chunk below the endpoint, with the chunk naming the Modbus transport:
//!
//! ```text
//! <endpoint>/<mode>          e.g. modgate/modbus/request/tcp
//! <prefix>/@/status          bridge status
//! <prefix>/@/health          bridge counters
//! ```

use zenoh::key_expr::KeyExpr;

use crate::error::{Error, Result};

/// Default key expression prefix for all ModGate bridges.
pub const KEY_PREFIX: &str = "modgate";

/// Join an endpoint prefix and a suffix chunk.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::join;
///
/// assert_eq!(join("modgate/modbus/response", "rtu"), "modgate/modbus/response/rtu");
/// assert_eq!(join("modgate/modbus", ""), "modgate/modbus");
/// ```
pub fn join(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, suffix)
    }
}

/// Wildcard matching everything published under an endpoint.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::subtree_wildcard;
///
/// assert_eq!(subtree_wildcard("modgate/modbus/request"), "modgate/modbus/request/**");
/// ```
pub fn subtree_wildcard(prefix: &str) -> String {
    format!("{}/**", prefix)
}

/// Key for bridge status reports.
pub fn status_key(prefix: &str) -> String {
    format!("{}/@/status", prefix)
}

/// Key for bridge health counters.
pub fn health_key(prefix: &str) -> String {
    format!("{}/@/health", prefix)
}

/// Return the part of `key` below `prefix`, or `None` if `key` is not under it.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::suffix_under;
///
/// assert_eq!(suffix_under("a/request", "a/request/tcp"), Some("tcp"));
/// assert_eq!(suffix_under("a/request", "a/request"), Some(""));
/// assert_eq!(suffix_under("a/request", "a/requests/tcp"), None);
/// ```
pub fn suffix_under<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix('/')
}

/// True if either endpoint is the other or lies below it, so that one
/// subscribes to what is published on the other.
///
/// # Example
/// ```
/// use modgate_common::keyexpr::overlaps;
///
/// assert!(overlaps("m/bus", "m/bus/resp"));
/// assert!(overlaps("m/bus/resp", "m/bus"));
/// assert!(!overlaps("m/bus", "m/bus2"));
/// ```
pub fn overlaps(a: &str, b: &str) -> bool {
    suffix_under(a, b).is_some() || suffix_under(b, a).is_some()
}

/// Check that an endpoint is a concrete (wildcard-free) key expression.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    if endpoint.is_empty() {
        return Err(Error::KeyExpr("endpoint cannot be empty".to_string()));
    }
    if endpoint.contains('*') || endpoint.contains('$') {
        return Err(Error::KeyExpr(format!(
            "endpoint '{}' must not contain wildcards",
            endpoint
        )));
    }
    KeyExpr::try_from(endpoint)
        .map(|_| ())
        .map_err(|e| Error::KeyExpr(format!("endpoint '{}': {}", endpoint, e)))
}
