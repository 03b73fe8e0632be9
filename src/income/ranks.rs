//! Rank tiers
//!
//! Ranks are unlocked in order by paying the activation price of the next
//! tier. Ordering follows declaration order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A tier in the referral hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Rank {
    Azurite = 1,
    Benitoite = 2,
    Crystals = 3,
    Diamond = 4,
    Emerald = 5,
    Feldspar = 6,
}

impl Rank {
    /// All ranks in ascending order
    pub const ALL: [Rank; 6] = [
        Rank::Azurite,
        Rank::Benitoite,
        Rank::Crystals,
        Rank::Diamond,
        Rank::Emerald,
        Rank::Feldspar,
    ];

    /// 1-based tier number
    pub fn tier(self) -> u8 {
        self as u8
    }

    pub fn from_tier(tier: u8) -> Option<Rank> {
        Rank::ALL.get((tier as usize).checked_sub(1)?).copied()
    }

    /// The next rank up, if any
    pub fn next(self) -> Option<Rank> {
        Rank::from_tier(self.tier() + 1)
    }

    /// The rank a user may activate next given their current rank
    pub fn next_for(current: Option<Rank>) -> Option<Rank> {
        match current {
            None => Some(Rank::Azurite),
            Some(rank) => rank.next(),
        }
    }

    /// This rank and every rank above it
    pub fn at_or_above(self) -> impl Iterator<Item = Rank> {
        Rank::ALL.into_iter().filter(move |r| *r >= self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rank::Azurite => "azurite",
            Rank::Benitoite => "benitoite",
            Rank::Crystals => "crystals",
            Rank::Diamond => "diamond",
            Rank::Emerald => "emerald",
            Rank::Feldspar => "feldspar",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Rank::ALL
            .into_iter()
            .find(|r| r.as_str() == lowered)
            .ok_or_else(|| format!("unknown rank: {s}"))
    }
}
