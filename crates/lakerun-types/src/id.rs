//! Opaque identifier newtypes.
//!
//! Every entity in a pipeline configuration is addressed by a string id
//! that is globally unique within a run. The newtypes keep the three id
//! spaces from being mixed up at compile time.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
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

        impl<S: Into<String>> From<S> for $name {
            fn from(value: S) -> Self {
                Self(value.into())
            }
        }
    };
}

string_id! {
    /// Identifier of an action (a node in the execution graph).
    ActionId
}

string_id! {
    /// Identifier of a data object (a logical table, file set, or stream).
    DataObjectId
}

string_id! {
    /// Identifier of a connection (credentials + session pool to a store).
    ConnectionId
}
