//! Branded ID newtypes.
//!
//! Events, sockets and devices each get a distinct ID type so a connection
//! handle can never be passed where a device identity is expected. Generated
//! IDs are UUID v7 (time-ordered).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
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

        impl Default for $name {
            fn default() -> Self {
                Self::new()
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

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a single instrumentation event.
    EventId
}

branded_id! {
    /// Identifier for one accepted socket. Transient: a new one is minted
    /// for every connection, including reconnects of the same device.
    ConnectionId
}

branded_id! {
    /// Stable identity of a physical device, supplied by the client in its
    /// handshake and preserved across reconnects.
    DeviceId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn event_id_new_is_uuid_v7() {
        let id = EventId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn device_id_from_client_string() {
        let id = DeviceId::from("iphone-15-sim");
        assert_eq!(id.as_str(), "iphone-15-sim");
        assert_eq!(format!("{id}"), "iphone-15-sim");
    }

    #[test]
    fn serde_is_transparent() {
        let id = DeviceId::from("dev-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"dev-1\"");
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(DeviceId::from("dev-1"), 1);
        assert_eq!(map.get("dev-1"), Some(&1));
    }
}
