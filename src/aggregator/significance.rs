// =============================================================================
// Significance Filter: price-tier dependent "notable move" detection
// =============================================================================
//
// Cheap coins need a large relative move before a change is worth reporting;
// expensive assets move a lot of money on a tiny relative change. The tier is
// looked up from the price just observed, not the stored one.
// =============================================================================

use anyhow::{bail, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One `[min_price, max_price) -> percent` bracket. Percent is in percent
/// units: `5.0` means a 5 % move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub min_price: f64,
    pub max_price: f64,
    pub percent: f64,
}

impl PriceTier {
    const fn new(min_price: f64, max_price: f64, percent: f64) -> Self {
        Self {
            min_price,
            max_price,
            percent,
        }
    }

    fn contains(&self, price: f64) -> bool {
        price >= self.min_price && price < self.max_price
    }
}

const DEFAULT_TIERS: [PriceTier; 8] = [
    PriceTier::new(0.0, 1.0, 5.0),
    PriceTier::new(1.0, 10.0, 3.0),
    PriceTier::new(10.0, 100.0, 2.0),
    PriceTier::new(100.0, 1_000.0, 1.0),
    PriceTier::new(1_000.0, 10_000.0, 0.5),
    PriceTier::new(10_000.0, 50_000.0, 0.1),
    PriceTier::new(50_000.0, 90_000.0, 0.01),
    PriceTier::new(90_000.0, 9_999_999.0, 0.001),
];

/// Threshold for prices above the last bracket.
const DEFAULT_FALLBACK_PERCENT: f64 = 0.001;

/// Ordered, disjoint price brackets plus a fallback. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTiers {
    tiers: Vec<PriceTier>,
    fallback_percent: f64,
}

impl Default for PriceTiers {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS.to_vec(),
            fallback_percent: DEFAULT_FALLBACK_PERCENT,
        }
    }
}

impl PriceTiers {
    pub fn new(tiers: Vec<PriceTier>, fallback_percent: f64) -> Result<Self> {
        let table = Self {
            tiers,
            fallback_percent,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            bail!("price tier table is empty");
        }
        if !(self.fallback_percent > 0.0) {
            bail!("fallback percent must be positive");
        }
        for (i, tier) in self.tiers.iter().enumerate() {
            if !(tier.min_price < tier.max_price) {
                bail!("tier {i} has an empty range [{}, {})", tier.min_price, tier.max_price);
            }
            if !(tier.percent > 0.0) {
                bail!("tier {i} percent must be positive");
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &self.tiers[p]) {
                if tier.min_price < prev.max_price {
                    bail!("tier {i} overlaps or precedes tier {}", i - 1);
                }
            }
        }
        Ok(())
    }

    /// Percent move required at `price`.
    pub fn percent_for(&self, price: f64) -> f64 {
        self.tiers
            .iter()
            .find(|t| t.contains(price))
            .map_or(self.fallback_percent, |t| t.percent)
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Outcome of a significant observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Significant {
    /// Last significant price, `None` on the first observation.
    pub previous: Option<f64>,
    /// Relative move in percent (0 on the first observation).
    pub change_percent: f64,
}

/// Remembers the last significant price per symbol.
pub struct SignificanceFilter {
    tiers: PriceTiers,
    last_prices: DashMap<String, f64>,
}

impl SignificanceFilter {
    pub fn new(tiers: PriceTiers) -> Self {
        Self {
            tiers,
            last_prices: DashMap::new(),
        }
    }

    /// Returns whether `price` moved enough since the last significant price;
    /// when it did, `price` becomes the new reference.
    pub fn is_significant(&self, symbol: &str, price: f64) -> bool {
        self.check(symbol, price).is_some()
    }

    /// Like [`is_significant`](Self::is_significant) but reports the move.
    ///
    /// The compare-and-store runs under the symbol's entry lock, so concurrent
    /// callers for one symbol are serialised.
    pub fn check(&self, symbol: &str, price: f64) -> Option<Significant> {
        match self.last_prices.entry(symbol.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(price);
                Some(Significant {
                    previous: None,
                    change_percent: 0.0,
                })
            }
            Entry::Occupied(mut slot) => {
                let last = *slot.get();
                // A stored zero would make every move infinite; treat it as
                // "no reference yet".
                if last == 0.0 {
                    slot.insert(price);
                    return Some(Significant {
                        previous: None,
                        change_percent: 0.0,
                    });
                }

                let change_percent = ((price - last) / last).abs() * 100.0;
                if change_percent >= self.tiers.percent_for(price) {
                    slot.insert(price);
                    Some(Significant {
                        previous: Some(last),
                        change_percent,
                    })
                } else {
                    None
                }
            }
        }
    }

    #[cfg(test)]
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).map(|p| *p)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
