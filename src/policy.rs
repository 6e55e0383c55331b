//! Cache expiry and refresh directives.
//!
//! A [`CachePolicy`] travels with every write and is persisted alongside the
//! entry. Its wire encoding is the string `keep`, the string `update`, or a
//! decimal Unix timestamp; anything unparseable decodes as `keep`.

use std::{
    convert::Infallible,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

/// Caching directive attached to each entry.
#[derive(Debug, Clone, Copy)]
pub enum CachePolicy {
    /// Take the policy from the enclosing group or context.
    Default,
    /// Never expires and is never re-validated.
    Keep,
    /// Forces a source fetch before the store is consulted.
    Update,
    /// Expires at an absolute time, in seconds since the Unix epoch.
    ExpiredAt(i64),
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl CachePolicy {
    /// A policy expiring the given number of seconds from now.
    pub fn in_seconds(seconds: u64) -> Self {
        Self::ExpiredAt(unix_now() + seconds as i64)
    }

    /// A policy expiring the given number of minutes from now.
    pub fn in_minutes(minutes: u64) -> Self {
        Self::in_seconds(minutes * 60)
    }

    /// A policy expiring the given number of hours from now.
    pub fn in_hours(hours: u64) -> Self {
        Self::in_seconds(hours * 3600)
    }

    /// A policy expiring the given number of days from now.
    pub fn in_days(days: u64) -> Self {
        Self::in_seconds(days * 86400)
    }

    /// A policy expiring at an absolute point in time.
    pub fn at(time: SystemTime) -> Self {
        let seconds = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::ExpiredAt(seconds)
    }

    /// Whether an entry stored under this policy is no longer servable.
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::ExpiredAt(t) if *t < unix_now())
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::Default
    }
}

// `Default` and `Keep` denote the same stored state, so they compare equal.
impl PartialEq for CachePolicy {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ExpiredAt(a), Self::ExpiredAt(b)) => a == b,
            (Self::Update, Self::Update) => true,
            (Self::Default | Self::Keep, Self::Default | Self::Keep) => true,
            _ => false,
        }
    }
}

impl Eq for CachePolicy {}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default | Self::Keep => write!(f, "keep"),
            Self::Update => write!(f, "update"),
            Self::ExpiredAt(t) => write!(f, "{t}"),
        }
    }
}

impl FromStr for CachePolicy {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "keep" => Self::Keep,
            "update" => Self::Update,
            other => other.parse::<i64>().map(Self::ExpiredAt).unwrap_or(Self::Keep),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_and_keep_are_the_same_state() {
        assert_eq!(CachePolicy::Default, CachePolicy::Keep);
        assert_eq!(CachePolicy::Keep, CachePolicy::Default);
        assert_ne!(CachePolicy::Keep, CachePolicy::Update);
        assert_ne!(CachePolicy::Update, CachePolicy::ExpiredAt(0));
        assert_eq!(CachePolicy::ExpiredAt(42), CachePolicy::ExpiredAt(42));
        assert_ne!(CachePolicy::ExpiredAt(42), CachePolicy::ExpiredAt(43));
    }

    #[test]
    fn expiry() {
        assert!(CachePolicy::ExpiredAt(1).is_expired());
        assert!(!CachePolicy::in_minutes(5).is_expired());
        assert!(!CachePolicy::Keep.is_expired());
        assert!(!CachePolicy::Default.is_expired());
        assert!(!CachePolicy::Update.is_expired());
        assert!(!CachePolicy::at(SystemTime::now() + std::time::Duration::from_secs(60)).is_expired());
    }

    #[test]
    fn wire_encoding() {
        assert_eq!(CachePolicy::Keep.to_string(), "keep");
        assert_eq!(CachePolicy::Default.to_string(), "keep");
        assert_eq!(CachePolicy::Update.to_string(), "update");
        assert_eq!(CachePolicy::ExpiredAt(1700000000).to_string(), "1700000000");

        assert_eq!("keep".parse::<CachePolicy>().unwrap(), CachePolicy::Keep);
        assert_eq!("update".parse::<CachePolicy>().unwrap(), CachePolicy::Update);
        assert_eq!(
            "1700000000".parse::<CachePolicy>().unwrap(),
            CachePolicy::ExpiredAt(1700000000)
        );
        // Parse failure decodes to keep.
        assert_eq!("bogus".parse::<CachePolicy>().unwrap(), CachePolicy::Keep);
    }
}
