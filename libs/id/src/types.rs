//! Typed ID definitions for control-plane resources.

use uuid::Uuid;

use crate::{define_resource_id, IdError};

// =============================================================================
// Edge Devices
// =============================================================================

define_resource_id!(EdgeId, "nuvlabox");
define_resource_id!(EdgeStatusId, "nuvlabox-status");

// =============================================================================
// Jobs
// =============================================================================

define_resource_id!(JobId, "job");

impl EdgeId {
    /// Workload name derived from this edge.
    ///
    /// Used as the helm release name and as the namespace search key, so it
    /// must be stable for a given edge.
    #[must_use]
    pub fn workload_name(&self) -> String {
        format!("nuvlaedge-{}", self.0)
    }
}

// =============================================================================
// Untyped Resource ID
// =============================================================================

/// Any control-plane resource ID (`{collection}/{uuid}`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    collection: String,
    uuid: Uuid,
}

impl ResourceId {
    /// Creates a resource ID from its parts.
    #[must_use]
    pub fn new(collection: impl Into<String>, uuid: Uuid) -> Self {
        Self {
            collection: collection.into(),
            uuid,
        }
    }

    /// Parses `{collection}/{uuid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((collection, uuid_str)) = s.split_once('/') else {
            return Err(IdError::MissingSeparator(s.to_string()));
        };

        if collection.is_empty() || uuid_str.contains('/') {
            return Err(IdError::InvalidFormat {
                message: format!("expected <collection>/<uuid>, got '{s}'"),
            });
        }

        let uuid = Uuid::parse_str(uuid_str).map_err(|e| IdError::InvalidUuid(e.to_string()))?;

        Ok(Self {
            collection: collection.to_string(),
            uuid,
        })
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the UUID portion.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.uuid)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
