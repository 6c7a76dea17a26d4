//! In-memory aggregate ledger
//!
//! Reference implementation of the additive-upsert contract: one aggregate
//! per (user, day), plus the highest applied sequence per client. The SQL
//! endpoint implements the same rules inside a transaction.

use std::collections::HashMap;

use crate::types::{
    format_day_key, ApplyDeltaRequest, ApplyDeltaResponse, DailyAggregate, DeltaValidationError,
};

#[derive(Debug, Default, Clone)]
struct LedgerRow {
    aggregate: DailyAggregate,
    last_applied: HashMap<String, u64>,
}

/// Additive per-day ledger keyed by (user, day)
#[derive(Debug, Default, Clone)]
pub struct AggregateLedger {
    rows: HashMap<(String, String), LedgerRow>,
}

impl AggregateLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a delta unless this client already landed an equal or higher
    /// sequence for the day.
    pub fn apply(
        &mut self,
        request: &ApplyDeltaRequest,
    ) -> Result<ApplyDeltaResponse, DeltaValidationError> {
        let date = format_day_key(request.validate()?);
        let row = self
            .rows
            .entry((request.user_id.clone(), date.clone()))
            .or_insert_with(|| LedgerRow {
                aggregate: DailyAggregate::empty(request.user_id.clone(), date),
                last_applied: HashMap::new(),
            });

        let last = row
            .last_applied
            .get(&request.client_id)
            .copied()
            .unwrap_or(0);

        if request.sequence <= last {
            return Ok(ApplyDeltaResponse {
                aggregate: row.aggregate.clone(),
                applied: false,
                sequence: request.sequence,
                last_applied_sequence: last,
            });
        }

        row.aggregate.apply_delta(
            request.delta_seconds,
            &request.delta_counts,
            request.delta_sessions,
        );
        row.last_applied
            .insert(request.client_id.clone(), request.sequence);

        Ok(ApplyDeltaResponse {
            aggregate: row.aggregate.clone(),
            applied: true,
            sequence: request.sequence,
            last_applied_sequence: request.sequence,
        })
    }

    pub fn get(&self, user_id: &str, date: &str) -> Option<&DailyAggregate> {
        self.rows
            .get(&(user_id.to_string(), date.to_string()))
            .map(|row| &row.aggregate)
    }

    pub fn last_applied_sequence(&self, user_id: &str, date: &str, client_id: &str) -> u64 {
        self.rows
            .get(&(user_id.to_string(), date.to_string()))
            .and_then(|row| row.last_applied.get(client_id).copied())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
