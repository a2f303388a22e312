//! Strongly-typed identifiers used across the delivery layer.

use core::str::FromStr;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identity of one wire-level event publication.
///
/// A fresh value is minted for every publish attempt, so a redelivered outbox
/// row reaches the broker under a new `EventId` each time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

/// Identifier of a durable outbox row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(EventId, "EventId");
impl_uuid_newtype!(OutboxEventId, "OutboxEventId");

/// Identifier of a queued job: `<jobName>-<unixMillis>-<random>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a fresh id for a job with the given handler name.
    pub fn generate(job_name: &str) -> Self {
        let millis = Utc::now().timestamp_millis();
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{job_name}-{millis}-{}", &random[..9]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(CoreError::invalid_id("JobId: empty"));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl PartialEq<str> for JobId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for JobId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_has_name_timestamp_and_random_parts() {
        let id = JobId::generate("send-email");
        let s = id.as_str();
        assert!(s.starts_with("send-email-"));

        let mut parts = s.rsplitn(3, '-');
        let random = parts.next().unwrap();
        let millis = parts.next().unwrap();
        assert_eq!(random.len(), 9);
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(parts.next(), Some("send-email"));
    }

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::generate("x");
        let b = JobId::generate("x");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_job_id_is_rejected() {
        assert!(JobId::from_str("  ").is_err());
        assert_eq!(JobId::from_str("job-42").unwrap(), "job-42");
    }

    #[test]
    fn uuid_ids_round_trip_through_strings() {
        let id = OutboxEventId::new();
        let parsed: OutboxEventId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<EventId>().is_err());
    }
}
