//! Partial-fill secret allocation

use crate::error::{CoordinatorError, CoordinatorResult};

use serde::{Deserialize, Serialize};

/// Smallest secret index `i` with `i / parts >= (filled + amount) / total`,
/// or `parts + 1` when the fill brings the order to exactly 100%.
pub fn required_secret_index(
    total: u128,
    parts: u32,
    filled: u128,
    amount: u128,
) -> CoordinatorResult<u32> {
    if total == 0 || parts == 0 {
        return Err(CoordinatorError::InvalidFill(
            "order has no fillable amount".to_string(),
        ));
    }

    let cumulative = filled
        .checked_add(amount)
        .ok_or_else(|| CoordinatorError::InvalidFill("fill amount overflows".to_string()))?;

    if cumulative > total {
        return Err(CoordinatorError::InvalidFill(format!(
            "fill of {} exceeds remaining {}",
            amount,
            total.saturating_sub(filled)
        )));
    }
    if cumulative == total {
        return Ok(parts + 1);
    }

    let scaled = cumulative
        .checked_mul(parts as u128)
        .ok_or_else(|| CoordinatorError::InvalidFill("fill amount overflows".to_string()))?;
    if scaled == 0 {
        return Ok(0);
    }
    // Ceiling division; cumulative < total keeps this <= parts
    let index = (scaled - 1) / total + 1;
    Ok(index as u32)
}

/// One accepted fill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillRecord {
    pub resolver: String,
    pub amount: u128,
    pub secret_index: u32,
    pub cumulative: u128,
}

/// Fill progress of a splittable order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFillState {
    pub total_amount: u128,
    pub parts: u32,
    /// Append-only; an index here is never handed out again
    pub consumed: Vec<u32>,
    pub filled_amount: u128,
    pub completed: bool,
    pub fills: Vec<FillRecord>,
}

impl PartialFillState {
    pub fn new(total_amount: u128, parts: u32) -> Self {
        Self {
            total_amount,
            parts,
            consumed: Vec::new(),
            filled_amount: 0,
            completed: false,
            fills: Vec::new(),
        }
    }

    /// The completion secret's index
    pub fn completion_index(&self) -> u32 {
        self.parts + 1
    }

    pub fn is_consumed(&self, index: u32) -> bool {
        self.consumed.contains(&index)
    }

    /// Indices `1..=N+1` not yet consumed, in order
    pub fn available_indices(&self) -> Vec<u32> {
        (1..=self.completion_index())
            .filter(|i| !self.is_consumed(*i))
            .collect()
    }

    pub fn remaining(&self) -> u128 {
        self.total_amount.saturating_sub(self.filled_amount)
    }

    /// Index the next fill of `amount` must use
    pub fn required_secret_index(&self, amount: u128) -> CoordinatorResult<u32> {
        required_secret_index(self.total_amount, self.parts, self.filled_amount, amount)
    }

    /// Mark `index` used. Fails if it is out of range or already used.
    pub fn consume(&mut self, index: u32) -> CoordinatorResult<()> {
        if index == 0 || index > self.completion_index() || self.is_consumed(index) {
            return Err(CoordinatorError::SecretIndexUsed { index });
        }
        self.consumed.push(index);
        Ok(())
    }

    /// Validate and apply a fill authorized by secret `index`
    pub fn record_fill(
        &mut self,
        resolver: &str,
        amount: u128,
        index: u32,
    ) -> CoordinatorResult<FillRecord> {
        if self.completed {
            return Err(CoordinatorError::OrderCompleted(
                "partial fill on a completed order".to_string(),
            ));
        }
        if amount == 0 {
            return Err(CoordinatorError::InvalidFill("fill amount is zero".to_string()));
        }
        if self.is_consumed(index) {
            return Err(CoordinatorError::SecretIndexUsed { index });
        }

        let required = self.required_secret_index(amount)?;
        if self.is_consumed(required) {
            return Err(CoordinatorError::SecretIndexUsed { index: required });
        }
        if index != required {
            return Err(CoordinatorError::InvalidFill(format!(
                "fill of {} requires secret {}, got {}",
                amount, required, index
            )));
        }

        self.consume(index)?;
        self.filled_amount += amount;
        self.completed = self.filled_amount == self.total_amount;
        let record = FillRecord {
            resolver: resolver.to_string(),
            amount,
            secret_index: index,
            cumulative: self.filled_amount,
        };
        self.fills.push(record.clone());

        Ok(record)
    }

    /// Structural checks; a failure means the record was corrupted by a
    /// caller or storage bug
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for index in &self.consumed {
            if !seen.insert(*index) {
                return Err(format!("secret index {} consumed twice", index));
            }
            if *index == 0 || *index > self.completion_index() {
                return Err(format!("consumed index {} out of range", index));
            }
        }
        if self.filled_amount > self.total_amount {
            return Err(format!(
                "filled {} exceeds total {}",
                self.filled_amount, self.total_amount
            ));
        }
        if self.completed != (self.filled_amount == self.total_amount) {
            return Err("completion flag disagrees with filled amount".to_string());
        }
        let summed: u128 = self.fills.iter().map(|f| f.amount).sum();
        if summed != self.filled_amount {
            return Err(format!(
                "fills sum to {}, recorded {}",
                summed, self.filled_amount
            ));
        }
        Ok(())
    }
}
