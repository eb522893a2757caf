//! Cost estimation surface.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::invoke::FunctionStats;

/// One priced dimension of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostItem {
    pub name: String,
    pub unit: String,
    pub measured: f64,
    pub price_per_unit: f64,
}

impl CostItem {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, measured: f64, price: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            measured,
            price_per_unit: price,
        }
    }

    pub fn cost(&self) -> f64 {
        self.measured * self.price_per_unit
    }
}

/// Estimated cost of the work done so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub items: Vec<CostItem>,
}

impl CostBreakdown {
    pub fn push(&mut self, item: CostItem) {
        self.items.push(item);
    }

    pub fn total(&self) -> f64 {
        self.items.iter().map(CostItem::cost).sum()
    }
}

/// Per-request plus per-GB-second price list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub per_request: f64,
    pub per_gb_second: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            per_request: 0.000_000_2,
            per_gb_second: 0.000_016_666_7,
        }
    }
}

impl Pricing {
    pub const FREE: Pricing = Pricing {
        per_request: 0.0,
        per_gb_second: 0.0,
    };

    /// Price the completed and failed invocations in `stats`, billing
    /// estimated execution time at `memory_mb`.
    pub fn breakdown(&self, stats: &FunctionStats, memory_mb: u32) -> CostBreakdown {
        let billed = &stats.estimated_billed_time;
        let billed_secs = billed.mean() * billed.samples() as f64 / 1000.0;
        let gb_seconds = billed_secs * f64::from(memory_mb) / 1024.0;
        let requests = (stats.completed + stats.errors) as f64;
        CostBreakdown {
            items: vec![
                CostItem::new("functionCallRequests", "request", requests, self.per_request),
                CostItem::new("functionCallDuration", "GB-second", gb_seconds, self.per_gb_second),
            ],
        }
    }
}

impl fmt::Display for CostBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            writeln!(
                f,
                "{:<16} {:>12.4} {:<12} x {:.8} = ${:.8}",
                item.name,
                item.measured,
                item.unit,
                item.price_per_unit,
                item.cost()
            )?;
        }
        write!(f, "total: ${:.8}", self.total())
    }
}
