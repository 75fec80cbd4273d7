//! Switched component banks.
//!
//! The resonance capacitors and the load resistors are each a set of
//! components gated by microcontroller pins, always in parallel with a base
//! value. Switching pin subsets yields `2^N` selectable sums; selection asks
//! for the smallest sum at or above a target so the tank is never tuned
//! below the requested value.

use tracing::warn;

use crate::error::{BenchError, Result};

/// One selectable subset of the bank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Combination {
    /// Base value plus the selected components.
    pub total: f64,
    /// Bit `i` selects `elements[i]` (pin order).
    pub mask: u16,
    /// Number of gated components in the subset.
    pub pin_count: u32,
}

/// Precomputed subset-sum table for one component bank.
#[derive(Debug, Clone)]
pub struct SwitchBank {
    base: f64,
    pins: Vec<u8>,
    /// All `2^N` combinations sorted by `(total, pin_count, mask)`.
    table: Vec<Combination>,
}

impl SwitchBank {
    /// Build the table from the base value, the gated component values and
    /// their pin numbers (`elements[i]` is gated by `pins[i]`).
    pub fn new(base: f64, elements: &[f64], pins: &[u8]) -> Result<Self> {
        if elements.len() != pins.len() {
            return Err(BenchError::Settings(format!(
                "bank needs one pin per element ({} elements, {} pins)",
                elements.len(),
                pins.len()
            )));
        }
        if elements.len() > 16 {
            return Err(BenchError::Settings(format!(
                "bank supports at most 16 gated elements, got {}",
                elements.len()
            )));
        }
        if base < 0.0 || elements.iter().any(|&e| e <= 0.0) {
            return Err(BenchError::Settings(
                "bank values must be positive (base may be zero)".into(),
            ));
        }

        let n = elements.len() as u32;
        let mut table = Vec::with_capacity(1 << n);
        for mask in 0u16..(1u16 << n) {
            let mut total = base;
            for (i, &value) in elements.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    total += value;
                }
            }
            table.push(Combination {
                total,
                mask,
                pin_count: mask.count_ones(),
            });
        }
        // Sort order doubles as the tie rule: for equal sums the subset
        // with fewer pins, then the lower mask, comes first.
        table.sort_by(|a, b| {
            a.total
                .total_cmp(&b.total)
                .then(a.pin_count.cmp(&b.pin_count))
                .then(a.mask.cmp(&b.mask))
        });

        Ok(SwitchBank {
            base,
            pins: pins.to_vec(),
            table,
        })
    }

    /// The always-connected base value.
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Largest selectable sum.
    pub fn max_total(&self) -> f64 {
        self.table.last().map(|c| c.total).unwrap_or(self.base)
    }

    /// Smallest sum at or above `target`. Targets above the table clamp to
    /// the largest combination.
    pub fn pick(&self, target: f64) -> Combination {
        match self
            .table
            .iter()
            .find(|combination| combination.total >= target)
        {
            Some(&combination) => combination,
            None => {
                let top = self.table[self.table.len() - 1];
                warn!(
                    target,
                    max = top.total,
                    "bank target above largest combination, clamping"
                );
                top
            }
        }
    }

    /// Distinct sums within `[lo, hi]`, ascending. Equal sums reachable by
    /// several subsets appear once, represented by their tie winner.
    pub fn combinations_in(&self, lo: f64, hi: f64) -> Vec<Combination> {
        let mut result: Vec<Combination> = Vec::new();
        for &combination in &self.table {
            if combination.total < lo || combination.total > hi {
                continue;
            }
            let duplicate = result.last().is_some_and(|prev| {
                (combination.total - prev.total).abs()
                    <= 1e-9 * (1.0 + combination.total.abs())
            });
            if !duplicate {
                result.push(combination);
            }
        }
        result
    }

    /// Pin numbers selected by `mask`, in configured order.
    pub fn mask_to_pins(&self, mask: u16) -> Vec<u8> {
        self.pins
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, &pin)| pin)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> SwitchBank {
        SwitchBank::new(33.0, &[47.0, 100.0, 220.0], &[2, 3, 4]).unwrap()
    }

    #[test]
    fn pick_returns_smallest_sum_at_or_above_target() {
        let bank = bank();
        // Sums: 33, 80, 133, 180, 253, 300, 353, 400.
        assert_eq!(bank.pick(0.0).total, 33.0);
        assert_eq!(bank.pick(33.0).total, 33.0);
        assert_eq!(bank.pick(34.0).total, 80.0);
        assert_eq!(bank.pick(200.0).total, 253.0);
        assert_eq!(bank.pick(400.0).total, 400.0);
    }

    #[test]
    fn pick_is_monotone_in_the_target() {
        let bank = bank();
        let mut previous = f64::NEG_INFINITY;
        let mut target = 0.0;
        while target <= 420.0 {
            let total = bank.pick(target).total;
            assert!(
                total >= previous,
                "target {target}: {total} < previous {previous}"
            );
            previous = total;
            target += 1.0;
        }
    }

    #[test]
    fn pick_above_table_clamps_to_largest() {
        let bank = bank();
        assert_eq!(bank.pick(1e9).total, 400.0);
    }

    #[test]
    fn equal_sums_resolve_to_fewest_pins_then_lowest_mask() {
        // 50 = base + 30+20 = base + 50 (one pin). One-pin subset wins.
        let bank = SwitchBank::new(0.0, &[30.0, 20.0, 50.0], &[2, 3, 4]).unwrap();
        let picked = bank.pick(50.0);
        assert_eq!(picked.total, 50.0);
        assert_eq!(picked.pin_count, 1);
        assert_eq!(picked.mask, 0b100);

        // Two identical one-pin subsets: the lower mask wins.
        let bank = SwitchBank::new(0.0, &[10.0, 10.0], &[2, 3]).unwrap();
        let picked = bank.pick(10.0);
        assert_eq!(picked.mask, 0b01);
    }

    #[test]
    fn combinations_in_window_are_ascending_and_distinct() {
        let bank = bank();
        let combos = bank.combinations_in(100.0, 360.0);
        let totals: Vec<f64> = combos.iter().map(|c| c.total).collect();
        assert_eq!(totals, vec![133.0, 180.0, 253.0, 300.0, 353.0]);
    }

    #[test]
    fn mask_maps_back_to_configured_pins() {
        let bank = bank();
        assert_eq!(bank.mask_to_pins(0b101), vec![2, 4]);
        assert!(bank.mask_to_pins(0).is_empty());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(SwitchBank::new(0.0, &[1.0, 2.0], &[2]).is_err());
        assert!(SwitchBank::new(0.0, &[-1.0], &[2]).is_err());
    }
}
