//! Three-way human judgement between two tie-groups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of comparing the left-hand group against the right-hand group.
///
/// For the reducer the left-hand side is the champion, for the merger it is
/// the element being placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Greater,
    Equal,
    Less,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greater => "greater",
            Self::Equal => "equal",
            Self::Less => "less",
        }
    }

    /// The same judgement read from the other side of the pair.
    pub fn inverse(self) -> Self {
        match self {
            Self::Greater => Self::Less,
            Self::Equal => Self::Equal,
            Self::Less => Self::Greater,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid decision {0:?}; expected greater/equal/less or >/=/<")]
pub struct ParseDecisionError(pub String);

impl FromStr for Decision {
    type Err = ParseDecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greater" | "gt" | ">" => Ok(Self::Greater),
            "equal" | "eq" | "=" => Ok(Self::Equal),
            "less" | "lt" | "<" => Ok(Self::Less),
            _ => Err(ParseDecisionError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_words_and_symbols() {
        assert_eq!("greater".parse::<Decision>().unwrap(), Decision::Greater);
        assert_eq!(" = ".parse::<Decision>().unwrap(), Decision::Equal);
        assert_eq!("LT".parse::<Decision>().unwrap(), Decision::Less);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[test]
    fn inverse_swaps_strict_relations_only() {
        assert_eq!(Decision::Greater.inverse(), Decision::Less);
        assert_eq!(Decision::Less.inverse(), Decision::Greater);
        assert_eq!(Decision::Equal.inverse(), Decision::Equal);
    }

    #[test]
    fn serializes_snake_case() {
        let raw = serde_json::to_string(&Decision::Greater).unwrap();
        assert_eq!(raw, "\"greater\"");
    }
}
