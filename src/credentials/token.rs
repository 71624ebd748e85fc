//! Pure security token construction
//!
//! Token format:
//! `SharedAccessSignature sr={encoded resource}&sig={encoded digest}&se={expiry}`
//! where the digest is the signing service's signature over
//! `{encoded resource}\n{expiry}`.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

pub const TOKEN_PREFIX: &str = "SharedAccessSignature";

/// Time-bounded broker credential
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityToken {
    value: String,
    expiry: i64,
    ttl: Duration,
}

impl SecurityToken {
    /// Assemble a token from its signed parts
    pub fn new(resource_uri: &str, signature: &str, expiry: i64, ttl: Duration) -> Self {
        Self {
            value: format_token(resource_uri, signature, expiry),
            expiry,
            ttl,
        }
    }

    /// Full token text, used as the MQTT password
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Expiry as seconds since the Unix epoch
    pub fn expiry_secs(&self) -> i64 {
        self.expiry
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.expiry, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expiry
    }

    /// True when the token expires within `margin` of `now`
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = i64::try_from(margin.as_secs()).unwrap_or(i64::MAX);
        now.timestamp().saturating_add(margin) >= self.expiry
    }
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityToken")
            .field("expiry", &self.expiry())
            .field("ttl", &self.ttl)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TOKEN_PREFIX} (expires {})", self.expiry().to_rfc3339())
    }
}

/// Percent-encode a token component
pub fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Expiry for the next token.
///
/// Never earlier than one second past the previous expiry, so a renewed token
/// always differs from the one it replaces.
pub fn next_expiry(now_secs: i64, ttl: Duration, previous: Option<i64>) -> i64 {
    let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let candidate = now_secs.saturating_add(ttl);
    match previous {
        Some(prev) => candidate.max(prev.saturating_add(1)),
        None => candidate,
    }
}

/// Text handed to the signing service
pub fn string_to_sign(resource_uri: &str, expiry: i64) -> String {
    format!("{}\n{}", url_encode(resource_uri), expiry)
}

pub fn format_token(resource_uri: &str, signature: &str, expiry: i64) -> String {
    format!(
        "{TOKEN_PREFIX} sr={}&sig={}&se={}",
        url_encode(resource_uri),
        url_encode(signature),
        expiry
    )
}
