//! Synchronized collection names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A server-side collection that clients mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Registered battery systems
    Systems,
    /// Extraction records, one per content hash
    History,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Systems, Collection::History];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Systems => "systems",
            Collection::History => "history",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "systems" => Ok(Collection::Systems),
            "history" => Ok(Collection::History),
            other => Err(AppError::invalid_input(format!("unknown collection '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_collections() {
        for c in Collection::ALL {
            assert_eq!(c.as_str().parse::<Collection>().unwrap(), c);
        }
        assert!("History".parse::<Collection>().is_err());
    }
}
