//! Identifier wrappers shared across the export pipeline.
//!
//! Export jobs are minted here and carry UUIDs. Everything else (executions,
//! accounts, users, activities, stored files) is owned by an upstream system,
//! so those ids are opaque non-empty strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! impl_id_common {
    ($name:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl_id_common!($name);
    };
}

macro_rules! define_opaque_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(IdParseError::new(format!("Invalid {}: empty", $label)));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl_id_common!($name);
    };
}

define_uuid_id!(ExportJobId, "export job ID");

define_opaque_id!(AccountId, "account ID");
define_opaque_id!(ExecutionId, "execution ID");
define_opaque_id!(UserId, "user ID");
define_opaque_id!(UserGroupId, "user group ID");
define_opaque_id!(ActivityId, "activity ID");
define_opaque_id!(FileId, "file ID");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_job_id_roundtrip() {
        let id = ExportJobId::new();
        let parsed: ExportJobId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_export_job_id_rejects_garbage() {
        let err = ExportJobId::parse("not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("export job ID"));
    }

    #[test]
    fn test_opaque_id_trims_and_rejects_empty() {
        assert_eq!(ExecutionId::parse("  exec-1 ").unwrap().as_str(), "exec-1");
        assert!(AccountId::parse("   ").is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = ActivityId::from("act-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"act-42\"");
    }
}
