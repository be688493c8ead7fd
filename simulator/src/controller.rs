//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use bankcore_common::Result as BankResult;
use bankcore_engine::{Bank, MetricsSnapshot};
use bankcore_ledger::MemoryStore;

use crate::customers::{Customer, CustomerFactory};
use crate::metrics::SimulationMetrics;
use crate::scenario::{Amount, AssertCondition, FaultType, Scenario, ScenarioStep};

/// End-of-run ledger check.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Sum of committed direct balance changes.
    pub expected_total: Decimal,
    /// Sum of the customers' balances.
    pub actual_total: Decimal,
    /// Customers whose balance is below zero.
    pub negative_balances: Vec<String>,
    /// Customers whose ledger does not explain their balance.
    pub unreconciled: Vec<String>,
}

impl Verification {
    /// Conservation and non-negativity both hold.
    pub fn passed(&self) -> bool {
        self.expected_total == self.actual_total && self.negative_balances.is_empty()
    }
}

/// Workload shape.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Customers to open.
    pub customers: usize,
    /// Owner id of the first customer.
    pub first_owner: i64,
    /// Deposited into every customer account.
    pub opening_balance: Decimal,
    /// Operations per second per worker in continuous mode.
    pub rate: f64,
    /// Concurrent workers in continuous mode.
    pub workers: usize,
    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

/// Controls the simulation.
pub struct SimulationController {
    bank: Arc<Bank>,
    /// Fault injection handle; present only for the in-memory backend.
    memory: Option<Arc<MemoryStore>>,
    customer_count: usize,
    first_owner: i64,
    opening_balance: Decimal,
    rate: f64,
    workers: usize,
    rng: Arc<RwLock<StdRng>>,
    customers: Vec<Customer>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    running: Arc<RwLock<bool>>,
    /// Net money added through direct balance updates.
    expected_total: Arc<RwLock<Decimal>>,
    last_outcome: String,
    last_burst_committed: u64,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(
        bank: Arc<Bank>,
        memory: Option<Arc<MemoryStore>>,
        options: SimulationOptions,
    ) -> Self {
        let rng = match options.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            bank,
            memory,
            customer_count: options.customers,
            first_owner: options.first_owner,
            opening_balance: options.opening_balance,
            rate: options.rate,
            workers: options.workers.max(1),
            rng: Arc::new(RwLock::new(rng)),
            customers: Vec::new(),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            running: Arc::new(RwLock::new(false)),
            expected_total: Arc::new(RwLock::new(Decimal::ZERO)),
            last_outcome: "OK".to_string(),
            last_burst_committed: 0,
        }
    }

    /// Open and fund the customers.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        info!(customers = self.customer_count, "Initializing simulation");

        self.customers = CustomerFactory::open(
            &self.bank,
            self.customer_count,
            self.first_owner,
            self.opening_balance,
        )
        .await?;

        *self.expected_total.write().await =
            self.opening_balance * Decimal::from(self.customers.len() as u64);

        Ok(())
    }

    /// Run a scenario, failing on the first unmet assertion.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!(
            scenario = %scenario.name,
            description = %scenario.description,
            "Running scenario"
        );

        if self.customers.len() < scenario.customers {
            bail!(
                "Scenario {} needs {} customers, have {}",
                scenario.name,
                scenario.customers,
                self.customers.len()
            );
        }

        *self.running.write().await = true;

        for step in &scenario.steps {
            if !*self.running.read().await {
                break;
            }

            self.execute_step(step)
                .await
                .with_context(|| format!("step {step:?}"))?;
        }

        *self.running.write().await = false;

        Ok(())
    }

    /// Run random transfers until `duration` passes or Ctrl+C.
    pub async fn run(&self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!(workers = self.workers, rate = self.rate, "Running continuous workload");

        if self.customers.len() < 2 {
            bail!("Continuous mode needs at least 2 customers");
        }

        *self.running.write().await = true;

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let mut rng = StdRng::seed_from_u64(self.rng.write().await.gen());
            let bank = self.bank.clone();
            let customers = self.customers.clone();
            let metrics = self.metrics.clone();
            let running = self.running.clone();
            let delay = Duration::from_secs_f64(1.0 / self.rate.max(0.001));
            let ceiling = (self.opening_balance / Decimal::from(10))
                .trunc()
                .max(Decimal::ONE);

            handles.push(tokio::spawn(async move {
                while *running.read().await {
                    let from = rng.gen_range(0..customers.len());
                    let mut to = rng.gen_range(0..customers.len());
                    while to == from {
                        to = rng.gen_range(0..customers.len());
                    }
                    let cents = rng.gen_range(1..=ceiling_cents(ceiling));
                    let amount = Decimal::new(cents, 2);

                    let sender = &customers[from];
                    let started = Instant::now();
                    let outcome = bank
                        .transfer(sender.account, customers[to].account, sender.owner, amount)
                        .await;
                    metrics.write().await.record(&outcome, started.elapsed());

                    tokio::time::sleep(delay).await;
                }
            }));
        }

        match duration {
            Some(d) => {
                tokio::time::sleep(d).await;
            }
            None => {
                tokio::signal::ctrl_c().await?;
            }
        }

        *self.running.write().await = false;
        for handle in handles {
            handle.await?;
        }

        Ok(())
    }

    /// Check conservation, non-negativity and per-account reconciliation.
    pub async fn verify(&self) -> anyhow::Result<Verification> {
        let mut actual_total = Decimal::ZERO;
        let mut negative_balances = Vec::new();
        let mut unreconciled = Vec::new();

        for customer in &self.customers {
            let account = self.bank.get_account(customer.account, customer.owner).await?;
            actual_total += account.balance;
            if account.balance < Decimal::ZERO {
                negative_balances.push(customer.label.clone());
            }

            let report = self.bank.reconcile(customer.account, customer.owner).await?;
            if !report.is_consistent() {
                unreconciled.push(customer.label.clone());
            }
        }

        Ok(Verification {
            expected_total: *self.expected_total.read().await,
            actual_total,
            negative_balances,
            unreconciled,
        })
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Get the engine's own counters.
    pub fn engine_metrics(&self) -> MetricsSnapshot {
        self.bank.metrics()
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::UpdateBalance { customer, delta } => {
                let customer = self.customer(customer)?.clone();
                let delta = parse_amount(delta)?;

                let started = Instant::now();
                let outcome = self
                    .bank
                    .update_balance(customer.account, customer.owner, delta)
                    .await;
                self.note_balance_update(&outcome, delta).await;
                self.finish(&outcome, started).await;
            }
            ScenarioStep::Transfer { from, to, amount } => {
                let from = self.customer(from)?.clone();
                let to = self.customer(to)?.clone();
                let amount = self.resolve(amount, &from).await?;

                info!(from = %from.label, to = %to.label, amount = %amount, "Transfer");
                let started = Instant::now();
                let outcome = self
                    .bank
                    .transfer(from.account, to.account, from.owner, amount)
                    .await;
                self.finish(&outcome, started).await;
            }
            ScenarioStep::Burst {
                from,
                to,
                amount,
                count,
            } => {
                let from = self.customer(from)?.clone();
                let to = self.customer(to)?.clone();
                let amount = self.resolve(amount, &from).await?;

                info!(from = %from.label, to = %to.label, amount = %amount, count, "Burst");
                let transfers = (0..*count).map(|_| {
                    let bank = self.bank.clone();
                    let (from, to) = (from.clone(), to.clone());
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let outcome = bank
                            .transfer(from.account, to.account, from.owner, amount)
                            .await;
                        (outcome, started.elapsed())
                    })
                });

                let joined = join_all(transfers).await;
                self.last_burst_committed = self.collect(joined).await?;
            }
            ScenarioStep::PingPong {
                a,
                b,
                amount,
                rounds,
            } => {
                let a = self.customer(a)?.clone();
                let b = self.customer(b)?.clone();
                let amount = parse_amount(amount)?;

                info!(a = %a.label, b = %b.label, amount = %amount, rounds, "Ping-pong");
                let transfers = (0..rounds * 2).map(|i| {
                    let bank = self.bank.clone();
                    let (from, to) = if i % 2 == 0 {
                        (a.clone(), b.clone())
                    } else {
                        (b.clone(), a.clone())
                    };
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let outcome = bank
                            .transfer(from.account, to.account, from.owner, amount)
                            .await;
                        (outcome, started.elapsed())
                    })
                });

                let joined = join_all(transfers).await;
                self.last_burst_committed = self.collect(joined).await?;
            }
            ScenarioStep::Storm {
                transfers,
                max_amount,
            } => {
                info!(transfers, max_amount, "Storm");
                let mut plan = Vec::with_capacity(*transfers);
                {
                    let mut rng = self.rng.write().await;
                    let n = self.customers.len();
                    for _ in 0..*transfers {
                        let from = rng.gen_range(0..n);
                        let to = (from + rng.gen_range(1..n)) % n;
                        let amount = Decimal::from(rng.gen_range(1..=(*max_amount).max(1)));
                        plan.push((self.customers[from].clone(), self.customers[to].clone(), amount));
                    }
                }

                let handles = plan.into_iter().map(|(from, to, amount)| {
                    let bank = self.bank.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let outcome = bank
                            .transfer(from.account, to.account, from.owner, amount)
                            .await;
                        (outcome, started.elapsed())
                    })
                });

                let joined = join_all(handles).await;
                self.last_burst_committed = self.collect(joined).await?;
            }
            ScenarioStep::InjectFault { fault_type } => {
                info!(fault = ?fault_type, "Injecting fault");
                let memory = self.fault_handle()?;
                match fault_type {
                    FaultType::LatencyBeyondTimeout => {
                        let limit = self.bank.config().storage_timeout;
                        memory
                            .faults()
                            .set_latency(limit + Duration::from_millis(100));
                    }
                    FaultType::StorageUnavailable => memory.faults().set_unavailable(true),
                    FaultType::JournalRejectsWrites => {
                        memory.faults().set_fail_entry_appends(true)
                    }
                }
            }
            ScenarioStep::ClearFaults => {
                info!("Clearing faults");
                self.fault_handle()?.faults().clear();
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
                info!(condition = ?condition, "Assertion held");
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::LastOutcome { code } => {
                if &self.last_outcome != code {
                    bail!("expected outcome {code}, got {}", self.last_outcome);
                }
            }
            AssertCondition::BurstCommitted { count } => {
                if self.last_burst_committed != *count {
                    bail!(
                        "expected {count} committed transfers, got {}",
                        self.last_burst_committed
                    );
                }
            }
            AssertCondition::BalanceUnchanged { customer } => {
                let balance = self.balance_of(customer).await?;
                if balance != self.opening_balance {
                    bail!(
                        "{customer} balance {balance} differs from opening {}",
                        self.opening_balance
                    );
                }
            }
            AssertCondition::BalanceEquals { customer, amount } => {
                let expected = parse_amount(amount)?;
                let balance = self.balance_of(customer).await?;
                if balance != expected {
                    bail!("{customer} balance {balance}, expected {expected}");
                }
            }
            AssertCondition::Conserved => {
                let verification = self.verify().await?;
                if !verification.passed() {
                    bail!("ledger check failed: {verification:?}");
                }
            }
            AssertCondition::Reconciled {
                customer,
                consistent,
            } => {
                let customer = self.customer(customer)?;
                let report = self.bank.reconcile(customer.account, customer.owner).await?;
                if report.is_consistent() != *consistent {
                    bail!(
                        "{} reconciliation consistent={}, discrepancy {}",
                        customer.label,
                        report.is_consistent(),
                        report.discrepancy
                    );
                }
            }
        }

        Ok(())
    }

    fn customer(&self, label: &str) -> anyhow::Result<&Customer> {
        self.customers
            .iter()
            .find(|c| c.label == label)
            .ok_or_else(|| anyhow!("Unknown customer: {label}"))
    }

    fn fault_handle(&self) -> anyhow::Result<&Arc<MemoryStore>> {
        self.memory
            .as_ref()
            .ok_or_else(|| anyhow!("Fault injection requires the memory backend"))
    }

    async fn balance_of(&self, label: &str) -> anyhow::Result<Decimal> {
        let customer = self.customer(label)?;
        Ok(self
            .bank
            .get_account(customer.account, customer.owner)
            .await?
            .balance)
    }

    async fn resolve(&self, amount: &Amount, sender: &Customer) -> anyhow::Result<Decimal> {
        match amount {
            Amount::Fixed(value) => parse_amount(value),
            Amount::FullBalance => Ok(self
                .bank
                .get_account(sender.account, sender.owner)
                .await?
                .balance),
        }
    }

    async fn note_balance_update<T>(&self, outcome: &BankResult<T>, delta: Decimal) {
        let moved = match outcome {
            Ok(_) => true,
            Err(e) => e.money_moved(),
        };
        if moved {
            *self.expected_total.write().await += delta;
        }
    }

    async fn finish<T>(&mut self, outcome: &BankResult<T>, started: Instant) {
        self.metrics.write().await.record(outcome, started.elapsed());
        self.last_outcome = outcome_code(outcome).to_string();
        if let Err(e) = outcome {
            warn!(code = e.error_code(), error = %e, "Operation failed");
        }
    }

    /// Record spawned transfer outcomes and count the committed ones.
    async fn collect<T>(
        &self,
        joined: Vec<Result<(BankResult<T>, Duration), tokio::task::JoinError>>,
    ) -> anyhow::Result<u64> {
        let mut committed = 0;
        let mut metrics = self.metrics.write().await;

        for result in joined {
            let (outcome, latency) = result?;
            metrics.record(&outcome, latency);
            if outcome.is_ok() {
                committed += 1;
            }
        }

        info!(committed, "Concurrent transfers finished");
        Ok(committed)
    }
}

fn outcome_code<T>(outcome: &BankResult<T>) -> &'static str {
    match outcome {
        Ok(_) => "OK",
        Err(e) => e.error_code(),
    }
}

fn parse_amount(value: &str) -> anyhow::Result<Decimal> {
    value
        .parse::<Decimal>()
        .with_context(|| format!("invalid amount: {value}"))
}

fn ceiling_cents(ceiling: Decimal) -> i64 {
    (ceiling * Decimal::from(100)).to_i64().unwrap_or(100)
}
