//! Per-workspace usage quotas.
//!
//! Three caps: agent requests per month, concurrent live sandboxes, and
//! sandboxes created per month. Monthly counters are keyed by
//! `(workspace, YYYY-MM)` and mutated under the ledger lock, so a
//! check-and-increment is atomic per workspace per period.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;

use af_domain::config::QuotaConfig;
use af_domain::{Error, Result};

#[derive(Default, Clone, Copy)]
struct Counters {
    requests: u64,
    sandboxes: u64,
}

pub struct QuotaLedger {
    config: QuotaConfig,
    monthly: Mutex<HashMap<(String, String), Counters>>,
}

fn period_of(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            monthly: Mutex::new(HashMap::new()),
        }
    }

    /// Count one agent request against the workspace's monthly budget.
    pub fn charge_request(&self, workspace: &str, now: DateTime<Utc>) -> Result<()> {
        let mut ledger = self.monthly.lock();
        let counters = ledger
            .entry((workspace.to_string(), period_of(now)))
            .or_default();
        if let Some(limit) = self.config.requests_per_month {
            if counters.requests >= limit {
                return Err(Error::QuotaExceeded(format!(
                    "workspace {workspace} reached {limit} requests this month"
                )));
            }
        }
        counters.requests += 1;
        Ok(())
    }

    /// Admit one new sandbox: checks the concurrent cap (against the live
    /// count supplied by the session store) and the monthly creation cap.
    pub fn charge_sandbox(
        &self,
        workspace: &str,
        active_count: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(limit) = self.config.concurrent_sandboxes {
            if active_count as u64 >= limit {
                return Err(Error::QuotaExceeded(format!(
                    "workspace {workspace} already has {active_count} live sandboxes (limit {limit})"
                )));
            }
        }
        let mut ledger = self.monthly.lock();
        let counters = ledger
            .entry((workspace.to_string(), period_of(now)))
            .or_default();
        if let Some(limit) = self.config.sandboxes_per_month {
            if counters.sandboxes >= limit {
                return Err(Error::QuotaExceeded(format!(
                    "workspace {workspace} reached {limit} sandboxes this month"
                )));
            }
        }
        counters.sandboxes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(config: QuotaConfig) -> QuotaLedger {
        QuotaLedger::new(config)
    }

    #[test]
    fn requests_capped_per_month() {
        let ledger = ledger(QuotaConfig {
            requests_per_month: Some(2),
            concurrent_sandboxes: None,
            sandboxes_per_month: None,
        });
        let now = Utc::now();
        ledger.charge_request("w1", now).unwrap();
        ledger.charge_request("w1", now).unwrap();
        assert!(matches!(
            ledger.charge_request("w1", now),
            Err(Error::QuotaExceeded(_))
        ));
        // A different workspace has its own budget.
        ledger.charge_request("w2", now).unwrap();
    }

    #[test]
    fn new_period_resets_the_budget() {
        let ledger = ledger(QuotaConfig {
            requests_per_month: Some(1),
            concurrent_sandboxes: None,
            sandboxes_per_month: None,
        });
        let january = "2026-01-15T00:00:00Z".parse().unwrap();
        let february = "2026-02-01T00:00:00Z".parse().unwrap();
        ledger.charge_request("w1", january).unwrap();
        assert!(ledger.charge_request("w1", january).is_err());
        ledger.charge_request("w1", february).unwrap();
    }

    #[test]
    fn concurrent_sandboxes_checked_against_live_count() {
        let ledger = ledger(QuotaConfig {
            requests_per_month: None,
            concurrent_sandboxes: Some(2),
            sandboxes_per_month: None,
        });
        let now = Utc::now();
        ledger.charge_sandbox("w1", 0, now).unwrap();
        ledger.charge_sandbox("w1", 1, now).unwrap();
        assert!(matches!(
            ledger.charge_sandbox("w1", 2, now),
            Err(Error::QuotaExceeded(_))
        ));
    }

    #[test]
    fn monthly_sandbox_cap() {
        let ledger = ledger(QuotaConfig {
            requests_per_month: None,
            concurrent_sandboxes: None,
            sandboxes_per_month: Some(1),
        });
        let now = Utc::now();
        ledger.charge_sandbox("w1", 0, now).unwrap();
        assert!(ledger.charge_sandbox("w1", 0, now).is_err());
    }

    #[test]
    fn unlimited_by_default_for_requests() {
        let ledger = ledger(QuotaConfig {
            requests_per_month: None,
            concurrent_sandboxes: None,
            sandboxes_per_month: None,
        });
        let now = Utc::now();
        for _ in 0..100 {
            ledger.charge_request("w1", now).unwrap();
        }
    }
}
