use std::fmt;

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Connection handle, doubling as the mio token and as `usersocketid` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (raw, _) = RawId::deserialize(deserializer)?.into_key();
        raw.parse()
            .map(ConnectionId)
            .map_err(|_| serde::de::Error::custom(format!("not a connection id: {raw:?}")))
    }
}

/// Host ids arrive as JSON numbers or strings depending on the page that
/// produced them; both forms map to the same key.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl RawId {
    /// The map key, and whether the id arrived as a JSON number.
    fn into_key(self) -> (String, bool) {
        match self {
            RawId::Unsigned(n) => (n.to_string(), true),
            RawId::Signed(n) => (n.to_string(), true),
            RawId::Float(n) => (n.to_string(), true),
            RawId::Text(s) => (s.trim().to_string(), false),
        }
    }
}

/// Writes a key back in the JSON form it arrived in.
fn serialize_key<S: Serializer>(key: &str, numeric: bool, serializer: S) -> Result<S::Ok, S::Error> {
    if numeric {
        if let Ok(n) = key.parse::<u64>() {
            return serializer.serialize_u64(n);
        }
        if let Ok(n) = key.parse::<i64>() {
            return serializer.serialize_i64(n);
        }
        if let Ok(n) = key.parse::<f64>() {
            return serializer.serialize_f64(n);
        }
    }
    serializer.serialize_str(key)
}

/// Equality, hashing and ordering use the key alone, so `5` and `"5"` name
/// the same session; the numeric flag only shapes the echo.
macro_rules! host_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default)]
        pub struct $name {
            key: String,
            numeric: bool,
        }

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self {
                    key: id.into(),
                    numeric: false,
                }
            }

            pub fn as_str(&self) -> &str {
                &self.key
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.key == other.key
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.key.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.key.cmp(&other.key)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.key)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serialize_key(&self.key, self.numeric, serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let (key, numeric) = RawId::deserialize(deserializer)?.into_key();
                Ok(Self { key, numeric })
            }
        }
    };
}

host_id!(
    /// Quiz session (`sid`).
    SessionId
);
host_id!(
    /// Application user id of the person behind a connection.
    UserId
);
host_id!(GroupId);
