//! Calendar granularities and the registry of known tokens

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named calendar bucket size
///
/// Variants are ordered finest to coarsest, so `Granularity::Minute <
/// Granularity::Year` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Granularity {
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One calendar day
    Day,
    /// One week, starting on the configured weekday
    Week,
    /// One calendar month
    Month,
    /// Three calendar months starting in January, April, July or October
    Quarter,
    /// One calendar year
    Year,
}

impl Granularity {
    /// Every granularity the engine knows how to bucket, finest first
    pub const ALL: [Granularity; 7] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
        Granularity::Quarter,
        Granularity::Year,
    ];

    /// Canonical token used inside storage identifiers
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "1m",
            Granularity::Hour => "1h",
            Granularity::Day => "1d",
            Granularity::Week => "1w",
            Granularity::Month => "1mo",
            Granularity::Quarter => "1q",
            Granularity::Year => "1y",
        }
    }

    /// Long human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Jump in seconds that always lands strictly inside the following bucket
    ///
    /// Months are at most 31 days, so 31 days from a month start is always in
    /// the next month; quarters and years scale the same bound.
    pub(crate) fn step_seconds(&self) -> i64 {
        const DAY: i64 = 86_400;
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => DAY,
            Granularity::Week => 7 * DAY,
            Granularity::Month => 31 * DAY,
            Granularity::Quarter => 93 * DAY,
            Granularity::Year => 12 * 31 * DAY,
        }
    }

    /// Parse a list of tokens, failing on the first unknown one
    pub fn parse_list<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Granularity>, Error> {
        tokens.iter().map(|t| t.as_ref().parse()).collect()
    }
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        Granularity::ALL
            .iter()
            .copied()
            .find(|g| g.as_str() == token || g.name() == token)
            .ok_or_else(|| Error::UnknownGranularity(s.to_string()))
    }
}

impl TryFrom<String> for Granularity {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Granularity> for String {
    fn from(g: Granularity) -> Self {
        g.as_str().to_string()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
