//! The fixed, process-wide item catalog.
//!
//! The catalog is intentionally not extensible at runtime: every seller ledger and
//! every sale snapshot is keyed by one of these four names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the four goods the marketplace trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemName {
    Flower,
    Sugar,
    Potato,
    Oil,
}

impl ItemName {
    /// Every catalog entry, in a stable order.
    pub const ALL: [ItemName; 4] = [
        ItemName::Flower,
        ItemName::Sugar,
        ItemName::Potato,
        ItemName::Oil,
    ];
}

impl fmt::Display for ItemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemName::Flower => "flower",
            ItemName::Sugar => "sugar",
            ItemName::Potato => "potato",
            ItemName::Oil => "oil",
        };
        f.write_str(s)
    }
}

/// Error returned when a string does not name a catalog item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownItemName(pub String);

impl fmt::Display for UnknownItemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown catalog item: {}", self.0)
    }
}

impl std::error::Error for UnknownItemName {}

impl FromStr for ItemName {
    type Err = UnknownItemName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flower" => Ok(ItemName::Flower),
            "sugar" => Ok(ItemName::Sugar),
            "potato" => Ok(ItemName::Potato),
            "oil" => Ok(ItemName::Oil),
            _ => Err(UnknownItemName(s.to_string())),
        }
    }
}
