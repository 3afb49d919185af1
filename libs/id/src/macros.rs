//! Macros for defining typed resource ID types.

/// Macro to define a typed ID bound to a control-plane collection.
///
/// This generates a newtype wrapper around a UUID with:
/// - A `COLLECTION` constant
/// - `new()` to generate a fresh ID
/// - `parse()` to parse from string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - Conversion into the untyped `ResourceId`
///
/// # Example
///
/// ```ignore
/// define_resource_id!(EdgeId, "nuvlabox");
///
/// let parsed: EdgeId = "nuvlabox/6f1d4c1e-6a53-4d7e-9a2b-1c9a4c43f0a7".parse()?;
/// ```
#[macro_export]
macro_rules! define_resource_id {
    ($name:ident, $collection:literal) => {
        /// A typed ID for this resource collection.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// The collection this ID belongs to.
            pub const COLLECTION: &'static str = $collection;

            /// Creates a new ID with a random UUID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from a string.
            ///
            /// The string must be in the format `{collection}/{uuid}`.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let raw = $crate::ResourceId::parse(s)?;
                if raw.collection() != Self::COLLECTION {
                    return Err($crate::IdError::InvalidCollection {
                        expected: Self::COLLECTION,
                        actual: raw.collection().to_string(),
                    });
                }
                Ok(Self(raw.uuid()))
            }

            /// Returns the untyped form of this ID.
            #[must_use]
            pub fn to_resource_id(&self) -> $crate::ResourceId {
                $crate::ResourceId::new(Self::COLLECTION, self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}/{}", Self::COLLECTION, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$name> for $crate::ResourceId {
            fn from(id: $name) -> Self {
                id.to_resource_id()
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
