//! Macros for defining typed ID types.

/// Maximum length of an operator-chosen name, in bytes.
pub const MAX_NAME_LEN: usize = 253;

/// Defines a generated ID: a ULID written as `{prefix}_{ulid}`.
///
/// IDs order by creation time, since the ULID timestamp leads.
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed(Self::PREFIX, s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
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

/// Macro to define an operator-chosen name.
///
/// Names are free-form but must be usable as a single coordination path
/// segment: non-empty, at most [`MAX_NAME_LEN`] bytes, no `/` and no
/// whitespace or control characters.
#[macro_export]
macro_rules! define_name {
    ($name:ident) => {
        /// An operator-chosen name for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps a name.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::validate_name(s)?;
                Ok(Self(s.to_string()))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
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

/// Checks that `s` is a valid name. Used by [`define_name!`].
pub fn validate_name(s: &str) -> Result<(), crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }
    if s.len() > MAX_NAME_LEN {
        return Err(crate::IdError::TooLong {
            len: s.len(),
            max: MAX_NAME_LEN,
        });
    }
    if let Some(found) = s
        .chars()
        .find(|c| *c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(crate::IdError::InvalidCharacter {
            name: s.to_string(),
            found,
        });
    }
    Ok(())
}

/// Splits `{prefix}_{ulid}` and parses the ULID. Used by [`define_id!`].
#[doc(hidden)]
pub fn parse_prefixed(prefix: &'static str, s: &str) -> Result<crate::Ulid, crate::IdError> {
    if s.is_empty() {
        return Err(crate::IdError::Empty);
    }
    let ulid = s
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| crate::IdError::WrongKind {
            kind: prefix,
            input: s.to_string(),
        })?;
    ulid.parse().map_err(|e: ulid::DecodeError| crate::IdError::InvalidUlid {
        input: s.to_string(),
        reason: e.to_string(),
    })
}
