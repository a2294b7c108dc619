use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::ParseError;

/// Endpoint address that may embed credentials (API keys in the path or query).
/// Sensitive urls never show up in logs, their `Display` and `Debug` output is redacted.
#[derive(Hash, PartialEq, Eq, Clone)]
pub struct Url {
    inner: url::Url,
    redacted: bool,
}

impl Url {
    pub fn new_sensitive(s: &str) -> Result<Self, ParseError> {
        Ok(Self {
            inner: url::Url::parse(s)?,
            redacted: true,
        })
    }

    pub fn new_non_sensitive(s: &str) -> Result<Self, ParseError> {
        Ok(Self {
            inner: url::Url::parse(s)?,
            redacted: false,
        })
    }

    pub fn deserialize_sensitive<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Url::new_sensitive(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_non_sensitive<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Url::new_non_sensitive(&s).map_err(serde::de::Error::custom)
    }

    pub fn is_sensitive(&self) -> bool {
        self.redacted
    }
}

impl Deref for Url {
    type Target = url::Url;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for Url {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::new_non_sensitive(s)
    }
}

impl<'de> Deserialize<'de> for Url {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Url::deserialize_non_sensitive(deserializer)
    }
}

impl Serialize for Url {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.inner.as_str())
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.redacted {
            true => f.write_str("[REDACTED]"),
            false => f.write_str(self.inner.as_str()),
        }
    }
}

impl Debug for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}
