//! Lock record wire format: `hostname:pid:expires_at_unix`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use userenv_shared::errors::{UserEnvError, UserEnvResult};

use crate::util;

/// Who holds (or wants) the lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LockIdentity {
    pub hostname: String,
    pub pid: u32,
}

impl LockIdentity {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// Identity of this process.
    pub fn current() -> Self {
        Self::new(util::hostname(), std::process::id())
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (PID {})", self.hostname, self.pid)
    }
}

/// Body of the lock object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub hostname: String,
    pub pid: u32,
    /// Always UTC, whole seconds.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// A record for `identity` expiring `ttl` from now.
    pub fn new(identity: &LockIdentity, ttl: Duration) -> Self {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Self {
            hostname: identity.hostname.clone(),
            pid: identity.pid,
            expires_at: DateTime::from_timestamp(expires, 0).unwrap_or_else(Utc::now),
        }
    }

    pub fn identity(&self) -> LockIdentity {
        LockIdentity::new(self.hostname.clone(), self.pid)
    }

    pub fn is_owned_by(&self, identity: &LockIdentity) -> bool {
        self.hostname == identity.hostname && self.pid == identity.pid
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.hostname,
            self.pid,
            self.expires_at.timestamp()
        )
    }
}

impl FromStr for LockRecord {
    type Err = UserEnvError;

    fn from_str(s: &str) -> UserEnvResult<Self> {
        let invalid = |reason: &str| {
            UserEnvError::InvalidArgument(format!("invalid lock record '{}': {}", s, reason))
        };

        let s_trimmed = s.trim();
        let mut parts = s_trimmed.rsplitn(3, ':');
        let (Some(expires), Some(pid), Some(hostname)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected hostname:pid:expires_at"));
        };
        if hostname.is_empty() {
            return Err(invalid("empty hostname"));
        }

        let pid: u32 = pid.parse().map_err(|_| invalid("pid is not a number"))?;
        let expires: i64 = expires
            .parse()
            .map_err(|_| invalid("expiry is not a unix timestamp"))?;
        let expires_at =
            DateTime::from_timestamp(expires, 0).ok_or_else(|| invalid("expiry out of range"))?;

        Ok(Self {
            hostname: hostname.to_string(),
            pid,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let record = LockRecord {
            hostname: "machine-1".into(),
            pid: 4242,
            expires_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let text = record.to_string();
        assert_eq!(text, "machine-1:4242:1700000000");
        assert_eq!(text.parse::<LockRecord>().unwrap(), record);
    }

    #[test]
    fn test_new_truncates_to_seconds() {
        let identity = LockIdentity::new("h", 1);
        let record = LockRecord::new(&identity, Duration::from_secs(300));
        let parsed: LockRecord = record.to_string().parse().unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.is_owned_by(&identity));
        assert!(!parsed.is_expired());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "garbage",
            "host:pid:123",
            "host:12:soon",
            ":12:123",
            "host:-1:123",
        ] {
            assert!(bad.parse::<LockRecord>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_expiry() {
        let record = LockRecord {
            hostname: "h".into(),
            pid: 1,
            expires_at: DateTime::from_timestamp(100, 0).unwrap(),
        };
        assert!(record.is_expired_at(DateTime::from_timestamp(101, 0).unwrap()));
        assert!(!record.is_expired_at(DateTime::from_timestamp(100, 0).unwrap()));
    }
}
