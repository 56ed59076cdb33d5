use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An organizational role that hands over or accepts custody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Delivery,
    Hub,
    Driver,
    Marketing,
    Finance,
}

impl Actor {
    pub const ALL: [Actor; 5] = [
        Actor::Delivery,
        Actor::Hub,
        Actor::Driver,
        Actor::Marketing,
        Actor::Finance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::Delivery => "delivery",
            Actor::Hub => "hub",
            Actor::Driver => "driver",
            Actor::Marketing => "marketing",
            Actor::Finance => "finance",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Actor::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown actor '{}'", s))
    }
}

/// The user performing an operation together with the role they act in.
///
/// Authentication happens upstream; the core only checks that the role is
/// the one the stage table allows for the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorUser {
    pub user_id: String,
    pub role: Actor,
}

impl ActorUser {
    pub fn new(user_id: impl Into<String>, role: Actor) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Hub".parse::<Actor>(), Ok(Actor::Hub));
        assert_eq!("FINANCE".parse::<Actor>(), Ok(Actor::Finance));
        assert!("warehouse".parse::<Actor>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Actor::Marketing).unwrap(), "\"marketing\"");
    }
}
