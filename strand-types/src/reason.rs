//! Machine-readable reason strings carried in OK, CLOSED and NOTICE.
//!
//! Reasons follow the `<prefix>: <free text>` convention so clients can
//! branch on the prefix without parsing prose.

use std::fmt;

/// Conventional reason prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonPrefix {
    /// Malformed event, id mismatch or bad signature
    Invalid,
    /// Muted author, or re-submission of a deleted event
    Blocked,
    /// Operation needs authentication not yet presented
    AuthRequired,
    /// Authenticated but not authorized
    Restricted,
    /// Too many requests
    RateLimited,
    /// Unexpected or storage failure
    Error,
    /// Idempotent re-save
    Duplicate,
    /// Feature not offered by this relay
    Unsupported,
}

impl ReasonPrefix {
    /// Wire spelling of the prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Blocked => "blocked",
            Self::AuthRequired => "auth-required",
            Self::Restricted => "restricted",
            Self::RateLimited => "rate-limited",
            Self::Error => "error",
            Self::Duplicate => "duplicate",
            Self::Unsupported => "unsupported",
        }
    }

    /// Parse a wire prefix.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "invalid" => Self::Invalid,
            "blocked" => Self::Blocked,
            "auth-required" => Self::AuthRequired,
            "restricted" => Self::Restricted,
            "rate-limited" => Self::RateLimited,
            "error" => Self::Error,
            "duplicate" => Self::Duplicate,
            "unsupported" => Self::Unsupported,
            _ => return None,
        })
    }
}

/// A prefixed, human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason {
    /// Category
    pub prefix: ReasonPrefix,
    /// Free text
    pub message: String,
}

impl Reason {
    /// Build a reason.
    pub fn new(prefix: ReasonPrefix, message: impl Into<String>) -> Self {
        Self {
            prefix,
            message: message.into(),
        }
    }

    /// `invalid: ...`
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Invalid, message)
    }

    /// `blocked: ...`
    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Blocked, message)
    }

    /// `auth-required: ...`
    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::AuthRequired, message)
    }

    /// `restricted: ...`
    pub fn restricted(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Restricted, message)
    }

    /// `rate-limited: ...`
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::RateLimited, message)
    }

    /// `error: ...`
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Error, message)
    }

    /// `duplicate: ...`
    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Duplicate, message)
    }

    /// `unsupported: ...`
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ReasonPrefix::Unsupported, message)
    }

    /// Split a wire string back into a reason, if it carries a known prefix.
    pub fn parse(s: &str) -> Option<Self> {
        let (prefix, rest) = s.split_once(':')?;
        let prefix = ReasonPrefix::parse(prefix)?;
        Some(Self::new(prefix, rest.trim_start()))
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.prefix.as_str(), self.message)
    }
}

impl From<Reason> for String {
    fn from(reason: Reason) -> Self {
        reason.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_prefix() {
        assert_eq!(
            Reason::blocked("muted").to_string(),
            "blocked: muted"
        );
        assert_eq!(
            Reason::auth_required("sign in").to_string(),
            "auth-required: sign in"
        );
    }

    #[test]
    fn parse_roundtrip() {
        let r = Reason::parse("rate-limited: slow down").unwrap();
        assert_eq!(r.prefix, ReasonPrefix::RateLimited);
        assert_eq!(r.message, "slow down");
        assert!(Reason::parse("nonsense: x").is_none());
        assert!(Reason::parse("no prefix").is_none());
    }
}
