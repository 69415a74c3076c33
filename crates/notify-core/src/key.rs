use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("subscription key missing '-' separator: {0}")]
    MissingSeparator(String),
    #[error("unknown subscription domain: {0}")]
    UnknownDomain(String),
    #[error("subscription key has empty entity")]
    EmptyEntity,
}

/// Notification domains clients can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Auction,
    Payment,
    Contract,
    User,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Auction => "auction",
            Domain::Payment => "payment",
            Domain::Contract => "contract",
            Domain::User => "user",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auction" => Ok(Domain::Auction),
            "payment" => Ok(Domain::Payment),
            "contract" => Ok(Domain::Contract),
            "user" => Ok(Domain::User),
            other => Err(KeyError::UnknownDomain(other.to_string())),
        }
    }
}

/// Channel address a connection subscribes to, rendered
/// `{domain}-{entity}` (for example `auction-42`). The entity half may
/// itself contain dashes; parsing splits on the first one only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    domain: Domain,
    entity: String,
}

impl SubscriptionKey {
    pub fn new(domain: Domain, entity: impl Into<String>) -> Result<Self, KeyError> {
        let entity = entity.into();
        if entity.is_empty() {
            return Err(KeyError::EmptyEntity);
        }
        Ok(Self { domain, entity })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.domain, self.entity)
    }
}

impl FromStr for SubscriptionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((domain, entity)) = s.split_once('-') else {
            return Err(KeyError::MissingSeparator(s.to_string()));
        };
        Self::new(domain.parse()?, entity)
    }
}

// Keys travel the wire in their rendered form.
impl Serialize for SubscriptionKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubscriptionKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
