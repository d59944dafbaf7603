//! Per-thread cost accounting.

use std::time::Instant;

use kiwi_types::{CostSnapshot, PricingTable, TurnUsage};

/// Running counters for one thread. Counters only increase for the life of
/// the thread.
#[derive(Debug, Clone)]
pub struct CostLedger {
    snapshot: CostSnapshot,
    pricing: PricingTable,
    started: Instant,
}

impl CostLedger {
    #[must_use]
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            snapshot: CostSnapshot::default(),
            pricing,
            started: Instant::now(),
        }
    }

    /// Fold one turn's normalized usage into the ledger.
    pub fn update_after_turn(&mut self, usage: TurnUsage, model: &str) {
        self.snapshot.turns += 1;
        self.snapshot.input_tokens += usage.input_tokens;
        self.snapshot.output_tokens += usage.output_tokens;
        self.snapshot.tokens_total += usage.total_tokens;
        self.snapshot.spend_usd += self.pricing.spend_for(model, &usage);
        self.snapshot.estimated |= usage.estimated;
    }

    /// Record a child spawn. Called synchronously at spawn time.
    pub fn note_spawn(&mut self) {
        self.snapshot.spawns += 1;
    }

    #[must_use]
    pub fn turns(&self) -> u64 {
        self.snapshot.turns
    }

    #[must_use]
    pub fn spawns(&self) -> u64 {
        self.snapshot.spawns
    }

    /// Current counters with the duration refreshed.
    #[must_use]
    pub fn snapshot(&self) -> CostSnapshot {
        let mut snapshot = self.snapshot;
        snapshot.duration_seconds = self.started.elapsed().as_secs_f64();
        snapshot
    }
}
