//! Dutch-auction pricing
//!
//! The resolver-facing rate decays along a piecewise-linear curve and is
//! scaled by a gas-adjustment factor recomputed from base-fee observations.
//! The adjustment is asymmetric: a base-fee rise scales the rate by the full
//! ratio, a drop only by a configured share of the saving.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::OrderHash;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Seconds after auction start
    pub delay_secs: u64,
    /// In [0, 1]
    pub coefficient: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GasObservation {
    pub base_fee: u128,
    pub factor: f64,
    pub timestamp: i64,
}

/// Multiplier for a base fee of `current` against the order's `original`
pub fn gas_adjustment_factor(original: u128, current: u128, savings_share: f64) -> f64 {
    if original == 0 {
        return 1.0;
    }
    let original_f = original as f64;
    let current_f = current as f64;
    if current >= original {
        current_f / original_f
    } else {
        1.0 + savings_share * (original_f - current_f) / original_f
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionCurve {
    pub start_time: i64,
    pub duration_secs: u64,
    pub points: Vec<CurvePoint>,
    /// Base fee when the order was submitted
    pub original_base_fee: u128,
    pub gas_savings_share: f64,
    /// Append-only
    pub gas_log: Vec<GasObservation>,
}

impl AuctionCurve {
    pub fn new(
        start_time: i64,
        duration_secs: u64,
        points: Vec<CurvePoint>,
        original_base_fee: u128,
        gas_savings_share: f64,
    ) -> CoordinatorResult<Self> {
        if points.is_empty() {
            return Err(CoordinatorError::InvalidOrder(
                "auction curve needs at least one point".to_string(),
            ));
        }
        if points.windows(2).any(|w| w[0].delay_secs >= w[1].delay_secs) {
            return Err(CoordinatorError::InvalidOrder(
                "auction curve delays must be strictly increasing".to_string(),
            ));
        }
        if points
            .iter()
            .any(|p| !(0.0..=1.0).contains(&p.coefficient))
        {
            return Err(CoordinatorError::InvalidOrder(
                "auction curve coefficients must be within [0, 1]".to_string(),
            ));
        }
        if points.iter().any(|p| p.delay_secs > duration_secs) {
            return Err(CoordinatorError::InvalidOrder(
                "auction curve point beyond auction duration".to_string(),
            ));
        }

        Ok(Self {
            start_time,
            duration_secs,
            points,
            original_base_fee,
            gas_savings_share,
            gas_log: Vec::new(),
        })
    }

    /// Straight decay from 1 to 0 over `duration_secs`
    pub fn linear(
        start_time: i64,
        duration_secs: u64,
        original_base_fee: u128,
        gas_savings_share: f64,
    ) -> CoordinatorResult<Self> {
        Self::new(
            start_time,
            duration_secs,
            vec![
                CurvePoint {
                    delay_secs: 0,
                    coefficient: 1.0,
                },
                CurvePoint {
                    delay_secs: duration_secs.max(1),
                    coefficient: 0.0,
                },
            ],
            original_base_fee,
            gas_savings_share,
        )
    }

    /// Latest gas factor, 1.0 before any observation
    pub fn gas_factor(&self) -> f64 {
        self.gas_log.last().map(|o| o.factor).unwrap_or(1.0)
    }

    pub fn observe_base_fee(&mut self, base_fee: u128, timestamp: i64) -> f64 {
        let factor =
            gas_adjustment_factor(self.original_base_fee, base_fee, self.gas_savings_share);
        self.gas_log.push(GasObservation {
            base_fee,
            factor,
            timestamp,
        });
        factor
    }

    /// Curve coefficient at `time`, without gas adjustment
    pub fn coefficient_at(&self, time: i64) -> f64 {
        if time < self.start_time {
            return 0.0;
        }
        let elapsed = (time - self.start_time) as u64;
        if elapsed > self.duration_secs {
            return 0.0;
        }

        let first = self.points[0];
        if elapsed <= first.delay_secs {
            return first.coefficient;
        }
        for pair in self.points.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if elapsed <= b.delay_secs {
                let span = (b.delay_secs - a.delay_secs) as f64;
                let t = (elapsed - a.delay_secs) as f64 / span;
                return a.coefficient + (b.coefficient - a.coefficient) * t;
            }
        }
        self.points[self.points.len() - 1].coefficient
    }

    pub fn rate_at(&self, time: i64) -> f64 {
        self.coefficient_at(time) * self.gas_factor()
    }

    pub fn is_expired(&self, time: i64) -> bool {
        time > self.start_time + self.duration_secs as i64
    }
}

/// Live auctions keyed by order hash
pub struct AuctionBook {
    curves: DashMap<OrderHash, AuctionCurve>,
}

impl AuctionBook {
    pub fn new() -> Self {
        Self {
            curves: DashMap::new(),
        }
    }

    pub fn insert(&self, order_hash: OrderHash, curve: AuctionCurve) {
        self.curves.insert(order_hash, curve);
    }

    pub fn rate_at(&self, order_hash: &OrderHash, time: i64) -> Option<f64> {
        self.curves.get(order_hash).map(|c| c.rate_at(time))
    }

    pub fn curve(&self, order_hash: &OrderHash) -> Option<AuctionCurve> {
        self.curves.get(order_hash).map(|c| c.clone())
    }

    /// Record a base-fee observation on every live auction
    pub fn observe_base_fee(&self, base_fee: u128, timestamp: i64) -> usize {
        let mut updated = 0;
        for mut entry in self.curves.iter_mut() {
            let factor = entry.observe_base_fee(base_fee, timestamp);
            debug!(
                "Gas factor for order {} now {:.4} (base fee {})",
                entry.key(),
                factor,
                base_fee
            );
            updated += 1;
        }
        updated
    }

    pub fn remove(&self, order_hash: &OrderHash) -> Option<AuctionCurve> {
        self.curves.remove(order_hash).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }
}

impl Default for AuctionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: i64 = 1_700_000_000;

    fn curve() -> AuctionCurve {
        AuctionCurve::new(
            START,
            120,
            vec![
                CurvePoint {
                    delay_secs: 0,
                    coefficient: 1.0,
                },
                CurvePoint {
                    delay_secs: 60,
                    coefficient: 0.5,
                },
                CurvePoint {
                    delay_secs: 120,
                    coefficient: 0.3,
                },
            ],
            100,
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn test_interpolation() {
        let c = curve();
        assert_eq!(c.rate_at(START), 1.0);
        assert!((c.rate_at(START + 30) - 0.75).abs() < 1e-9);
        assert!((c.rate_at(START + 60) - 0.5).abs() < 1e-9);
        assert!((c.rate_at(START + 90) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_zero_outside_duration() {
        let c = curve();
        assert_eq!(c.rate_at(START - 1), 0.0);
        assert_eq!(c.rate_at(START + 121), 0.0);
        assert!(c.is_expired(START + 121));
    }

    #[test]
    fn test_gas_factor_asymmetric() {
        assert!((gas_adjustment_factor(100, 150, 0.5) - 1.5).abs() < 1e-9);
        assert!((gas_adjustment_factor(100, 60, 0.5) - 1.2).abs() < 1e-9);
        assert_eq!(gas_adjustment_factor(0, 60, 0.5), 1.0);
    }

    #[test]
    fn test_rate_uses_latest_observation() {
        let mut c = curve();
        c.observe_base_fee(200, START + 10);
        c.observe_base_fee(100, START + 20);
        assert_eq!(c.gas_log.len(), 2);
        assert_eq!(c.rate_at(START), 1.0);

        c.observe_base_fee(200, START + 30);
        assert!((c.rate_at(START + 60) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unsorted_points() {
        let points = vec![
            CurvePoint {
                delay_secs: 10,
                coefficient: 0.5,
            },
            CurvePoint {
                delay_secs: 5,
                coefficient: 0.4,
            },
        ];
        assert!(AuctionCurve::new(START, 60, points, 1, 0.5).is_err());
    }

    #[test]
    fn test_book_observes_all() {
        let book = AuctionBook::new();
        book.insert(OrderHash([1u8; 32]), curve());
        book.insert(OrderHash([2u8; 32]), curve());
        assert_eq!(book.observe_base_fee(150, START + 5), 2);
        let rate = book.rate_at(&OrderHash([1u8; 32]), START).unwrap();
        assert!((rate - 1.5).abs() < 1e-9);
        assert!(book.rate_at(&OrderHash([3u8; 32]), START).is_none());
    }
}
