//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Customers the steps refer to; must be opened before running.
    pub customers: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// How much a step moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Amount {
    /// A literal decimal amount.
    Fixed(String),
    /// The sender's balance at the moment the step starts.
    FullBalance,
}

/// A step in a scenario. Customers are referred to by label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Change a customer's balance directly; negative deltas withdraw.
    UpdateBalance { customer: String, delta: String },
    /// One transfer.
    Transfer {
        from: String,
        to: String,
        amount: Amount,
    },
    /// `count` identical transfers issued concurrently.
    Burst {
        from: String,
        to: String,
        amount: Amount,
        count: usize,
    },
    /// `rounds` pairs of opposite transfers, all issued concurrently.
    PingPong {
        a: String,
        b: String,
        amount: String,
        rounds: usize,
    },
    /// `transfers` random transfers between all customers, issued concurrently.
    Storm { transfers: usize, max_amount: u64 },
    /// Inject a storage fault.
    InjectFault { fault_type: FaultType },
    /// Clear every injected fault.
    ClearFaults,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Storage faults the in-memory backend can simulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Every call stalls for longer than the engine's storage timeout.
    LatencyBeyondTimeout,
    /// Every call fails.
    StorageUnavailable,
    /// Ledger entry writes are rejected. Direct balance updates roll back;
    /// transfer movements commit without their entries.
    JournalRejectsWrites,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// The previous single operation ended with this error code, or `OK`.
    LastOutcome { code: String },
    /// The previous concurrent step committed exactly this many transfers.
    BurstCommitted { count: u64 },
    /// The customer's balance equals its opening balance.
    BalanceUnchanged { customer: String },
    /// The customer's balance equals `amount`.
    BalanceEquals { customer: String, amount: String },
    /// Money is neither created nor destroyed and no balance is negative.
    Conserved,
    /// Whether the customer's ledger fully explains its balance.
    Reconciled { customer: String, consistent: bool },
}

fn transfer(from: &str, to: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Transfer {
        from: from.to_string(),
        to: to.to_string(),
        amount: Amount::Fixed(amount.to_string()),
    }
}

fn expect(code: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastOutcome {
            code: code.to_string(),
        },
    }
}

fn unchanged(customer: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceUnchanged {
            customer: customer.to_string(),
        },
    }
}

fn conserved() -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::Conserved,
    }
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 5] = [
        "ping-pong",
        "contention",
        "overdraft-race",
        "audit-fault",
        "slow-storage",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "ping-pong" => Ok(Self::ping_pong()),
            "contention" => Ok(Self::contention()),
            "overdraft-race" => Ok(Self::overdraft_race()),
            "audit-fault" => Ok(Self::audit_fault()),
            "slow-storage" => Ok(Self::slow_storage()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Opposite transfers over one pair of accounts.
    fn ping_pong() -> Self {
        Self {
            name: "ping-pong".to_string(),
            description: "Concurrent A->B and B->A transfers must not deadlock".to_string(),
            customers: 2,
            steps: vec![
                ScenarioStep::PingPong {
                    a: "ALICE".to_string(),
                    b: "BOB".to_string(),
                    amount: "2".to_string(),
                    rounds: 250,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BurstCommitted { count: 500 },
                },
                unchanged("ALICE"),
                unchanged("BOB"),
                conserved(),
            ],
        }
    }

    /// Random transfers among many accounts at once.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Concurrent random transfers across all customers".to_string(),
            customers: 5,
            steps: vec![
                ScenarioStep::Storm {
                    transfers: 1_000,
                    max_amount: 250,
                },
                conserved(),
                ScenarioStep::Assert {
                    condition: AssertCondition::Reconciled {
                        customer: "CAROL".to_string(),
                        consistent: true,
                    },
                },
            ],
        }
    }

    /// Many withdrawals of the same full balance; only one may win.
    fn overdraft_race() -> Self {
        Self {
            name: "overdraft-race".to_string(),
            description: "Concurrent transfers of the full balance commit exactly once"
                .to_string(),
            customers: 2,
            steps: vec![
                ScenarioStep::Burst {
                    from: "ALICE".to_string(),
                    to: "BOB".to_string(),
                    amount: Amount::FullBalance,
                    count: 20,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BurstCommitted { count: 1 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        customer: "ALICE".to_string(),
                        amount: "0".to_string(),
                    },
                },
                transfer("ALICE", "BOB", "1"),
                expect("INSUFFICIENT_FUNDS"),
                conserved(),
            ],
        }
    }

    /// Storage faults around a transfer, including a lost audit record.
    fn audit_fault() -> Self {
        Self {
            name: "audit-fault".to_string(),
            description:
                "Storage outages roll back; a journal failure diverges only after a transfer commit"
                    .to_string(),
            customers: 2,
            steps: vec![
                transfer("ALICE", "BOB", "100"),
                expect("OK"),
                ScenarioStep::InjectFault {
                    fault_type: FaultType::StorageUnavailable,
                },
                transfer("ALICE", "BOB", "50"),
                expect("STORAGE_ERROR"),
                ScenarioStep::ClearFaults,
                ScenarioStep::InjectFault {
                    fault_type: FaultType::JournalRejectsWrites,
                },
                ScenarioStep::UpdateBalance {
                    customer: "BOB".to_string(),
                    delta: "25".to_string(),
                },
                expect("STORAGE_ERROR"),
                transfer("ALICE", "BOB", "50"),
                expect("AUDIT_TRAIL_DIVERGED"),
                ScenarioStep::ClearFaults,
                ScenarioStep::Assert {
                    condition: AssertCondition::Reconciled {
                        customer: "ALICE".to_string(),
                        consistent: false,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Reconciled {
                        customer: "BOB".to_string(),
                        consistent: false,
                    },
                },
                conserved(),
            ],
        }
    }

    /// A stalled store; the engine must give up without moving money.
    fn slow_storage() -> Self {
        Self {
            name: "slow-storage".to_string(),
            description: "Storage calls beyond the deadline time out with no effect".to_string(),
            customers: 2,
            steps: vec![
                ScenarioStep::InjectFault {
                    fault_type: FaultType::LatencyBeyondTimeout,
                },
                transfer("ALICE", "BOB", "25"),
                expect("STORAGE_TIMEOUT"),
                ScenarioStep::ClearFaults,
                unchanged("ALICE"),
                unchanged("BOB"),
                ScenarioStep::UpdateBalance {
                    customer: "BOB".to_string(),
                    delta: "-25".to_string(),
                },
                expect("OK"),
                conserved(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_named_scenario_loads() {
        for name in Scenario::NAMES {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("unknown-scenario").is_err());
    }
}
