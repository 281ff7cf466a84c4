//! Branded ID newtypes.
//!
//! User and server identifiers are both plain strings on the wire, but mixing
//! them up would route a message to a broker channel named after a user. The
//! newtypes keep them apart at compile time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of every presence directory key.
pub const PRESENCE_KEY_PREFIX: &str = "user:";

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id!(
    /// Identifier of a connected user, supplied by the client at upgrade time.
    UserId
);

branded_id!(
    /// Identifier of a relay instance. Doubles as the name of the broker
    /// channel the instance subscribes to.
    ServerId
);

impl ServerId {
    /// Generate a fresh, time-ordered server identifier (`relay_<uuid v7>`).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("relay_{}", Uuid::now_v7()))
    }
}

/// Presence directory key for a user.
///
/// Every directory operation (set, lookup, delete) goes through this function
/// so the three can never disagree on the key.
#[must_use]
pub fn presence_key(user: &UserId) -> String {
    format!("{PRESENCE_KEY_PREFIX}{user}")
}
