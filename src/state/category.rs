//! Connection categories ingested by a run
//!
//! A run walks the categories in a fixed order; the order is part of the
//! resume contract, since a run state names the category to resume at.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A class of relationship between the account owner and a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Accepted, mutual connections
    Mutual,

    /// Connection requests received and not yet answered
    IncomingRequest,

    /// Connection requests sent and not yet accepted
    OutgoingRequest,
}

impl Category {
    /// All categories in processing order
    pub const ALL: [Category; 3] = [
        Category::Mutual,
        Category::IncomingRequest,
        Category::OutgoingRequest,
    ];

    /// Converts the category to its stored string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Mutual => "mutual",
            Self::IncomingRequest => "incoming-request",
            Self::OutgoingRequest => "outgoing-request",
        }
    }

    /// Parses a category from its stored string representation
    ///
    /// Returns None if the string doesn't match any known category.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "mutual" => Some(Self::Mutual),
            "incoming-request" => Some(Self::IncomingRequest),
            "outgoing-request" => Some(Self::OutgoingRequest),
            _ => None,
        }
    }

    /// Edge status written to the remote store for profiles in this category
    pub fn edge_status(&self) -> &'static str {
        match self {
            Self::Mutual => "ally",
            Self::IncomingRequest => "incoming",
            Self::OutgoingRequest => "outgoing",
        }
    }

    /// Whether a processed profile in this category is forwarded to ingestion
    pub fn triggers_ingestion(&self) -> bool {
        matches!(self, Self::Mutual | Self::OutgoingRequest)
    }

    /// The category processed after this one, if any
    pub fn next(&self) -> Option<Category> {
        match self {
            Self::Mutual => Some(Self::IncomingRequest),
            Self::IncomingRequest => Some(Self::OutgoingRequest),
            Self::OutgoingRequest => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}
