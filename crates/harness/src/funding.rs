//! Account funding reconciler.
//!
//! Brings a target account up to a [`FundingRequirement`] by either
//! splitting coins out of the treasury's gas or issuing faucet requests,
//! then polling until the requirement is observed on chain. Tolerates
//! partial failures: the outer loop re-checks and retries up to a bounded
//! number of rounds.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::HarnessError;
use crate::keystore::TestAccount;
use crate::rpc::{Address, CoinSnapshot, LedgerRpcClient, TransactionKind, TransactionRequest};

/// Default per-transaction minimum: one coin must clear this bar alone to
/// be usable as a gas coin.
pub const DEFAULT_SINGLE_COIN_BALANCE: u64 = 500_000_000;

/// Outer request → wait → re-check rounds before giving up.
const MAX_FUNDING_ROUNDS: u32 = 5;

/// Attempts per individual faucet request.
const FAUCET_ATTEMPTS: u32 = 3;

/// Delay between faucet request attempts.
const FAUCET_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Deadline for one confirmation-polling phase.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for confirmation polling.
const CONFIRMATION_INTERVAL: Duration = Duration::from_millis(500);

/// What an account must hold to count as funded.
///
/// The aggregate balance alone is not enough: at least one coin object
/// must individually clear `minimum_single_coin_balance`, otherwise a
/// fragmented balance cannot pay for a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingRequirement {
    pub minimum_total_balance: u64,
    pub minimum_coin_object_count: u64,
    pub minimum_single_coin_balance: u64,
}

impl Default for FundingRequirement {
    fn default() -> Self {
        Self::new(1, DEFAULT_SINGLE_COIN_BALANCE)
    }
}

impl FundingRequirement {
    /// Requirement with the total derived as `count * single`.
    pub fn new(minimum_coin_object_count: u64, minimum_single_coin_balance: u64) -> Self {
        Self {
            minimum_total_balance: minimum_single_coin_balance
                .saturating_mul(minimum_coin_object_count),
            minimum_coin_object_count,
            minimum_single_coin_balance,
        }
    }

    /// Override the derived total. An explicit total always wins over the
    /// derived one.
    pub fn with_total_balance(mut self, minimum_total_balance: u64) -> Self {
        self.minimum_total_balance = minimum_total_balance;
        self
    }

    /// Evaluate a coin snapshot against this requirement.
    pub fn is_satisfied_by(&self, snapshot: &CoinSnapshot) -> bool {
        snapshot.coin_count() >= self.minimum_coin_object_count
            && snapshot.total_balance() >= self.minimum_total_balance
            && snapshot.largest_coin_balance() >= self.minimum_single_coin_balance
    }
}

/// Where new coins come from. Exactly one source must be configured.
#[derive(Debug, Clone)]
pub enum FundingSource {
    /// Split and transfer out of a pre-funded node-local account.
    Treasury(TestAccount),
    /// Request mints from an auxiliary faucet HTTP service at this host.
    Faucet(String),
}

impl FundingSource {
    /// Pick the source from a node's capabilities; raises a configuration
    /// error unless exactly one of treasury/faucet is present.
    pub fn from_node_capabilities(
        treasury: Option<&TestAccount>,
        faucet_host: Option<&str>,
    ) -> Result<Self> {
        match (treasury, faucet_host) {
            (Some(treasury), None) => Ok(Self::Treasury(treasury.clone())),
            (None, Some(host)) => Ok(Self::Faucet(host.to_string())),
            (Some(_), Some(_)) => Err(HarnessError::Configuration(
                "both a treasury account and a faucet host are configured; \
                 funding requires exactly one source"
                    .to_string(),
            )
            .into()),
            (None, None) => Err(HarnessError::Configuration(
                "neither a treasury account nor a faucet host is available; \
                 cannot fund accounts"
                    .to_string(),
            )
            .into()),
        }
    }
}

/// Reconciliation progress, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FundingState {
    Checking,
    Transferring,
    Requesting,
    WaitingForConfirmation,
    Satisfied,
    Failed,
}

/// Outcome of a successful reconciliation, mainly for assertions: an
/// already-funded account reports zero transfers and zero faucet calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FundingReport {
    pub rounds: u32,
    pub transfers_submitted: u32,
    pub faucet_requests: u32,
}

/// Body of one faucet mint request.
#[derive(Debug, Serialize)]
struct FaucetRequest<'a> {
    recipient: &'a Address,
}

/// Reconciles account balances against funding requirements.
pub struct FundingReconciler<'a, C> {
    client: &'a C,
    source: FundingSource,
}

impl<'a, C: LedgerRpcClient> FundingReconciler<'a, C> {
    pub fn new(client: &'a C, source: FundingSource) -> Self {
        Self { client, source }
    }

    /// Bring `target` up to `requirement`. Idempotent: an already-funded
    /// account returns immediately without submitting anything.
    pub async fn fund(
        &self,
        target: &Address,
        requirement: &FundingRequirement,
    ) -> Result<FundingReport> {
        let mut report = FundingReport::default();
        let mut last_error = "no funding attempt made".to_string();

        for round in 1..=MAX_FUNDING_ROUNDS {
            report.rounds = round;
            self.transition(FundingState::Checking, target);

            let snapshot = self
                .client
                .get_coins(target)
                .await
                .context("failed to fetch coin snapshot")?;

            if requirement.is_satisfied_by(&snapshot) {
                self.transition(FundingState::Satisfied, target);
                return Ok(report);
            }

            let submitted = match &self.source {
                FundingSource::Treasury(treasury) => {
                    self.transition(FundingState::Transferring, target);
                    self.transfer_from_treasury(treasury, target, requirement)
                        .await
                        .inspect(|_| report.transfers_submitted += 1)
                }
                FundingSource::Faucet(host) => {
                    self.transition(FundingState::Requesting, target);
                    self.request_from_faucet(host, target, requirement, &snapshot)
                        .await
                        .inspect(|count| report.faucet_requests += count)
                        .map(|_| ())
                }
            };

            if let Err(err) = submitted {
                last_error = format!("{err:#}");
                tracing::warn!(round, target = %target, error = %last_error, "Funding submission failed");
                continue;
            }

            self.transition(FundingState::WaitingForConfirmation, target);
            match self.wait_for_confirmation(target, requirement).await {
                Ok(()) => {
                    self.transition(FundingState::Satisfied, target);
                    return Ok(report);
                }
                Err(err) => {
                    last_error = format!("{err:#}");
                    tracing::warn!(round, target = %target, error = %last_error, "Funding confirmation failed");
                }
            }
        }

        self.transition(FundingState::Failed, target);
        Err(HarnessError::FundingExhausted {
            rounds: MAX_FUNDING_ROUNDS,
            last_error,
        }
        .into())
    }

    fn transition(&self, state: FundingState, target: &Address) {
        tracing::debug!(?state, target = %target, "Funding reconciler");
    }

    /// Submit one transaction splitting the treasury's gas into
    /// `minimum_coin_object_count` coins and transferring them to `target`.
    ///
    /// Per-coin amount is `ceil(total / count)`, floored up to the single
    /// coin minimum so every resulting coin individually clears the
    /// gas-coin bar.
    async fn transfer_from_treasury(
        &self,
        treasury: &TestAccount,
        target: &Address,
        requirement: &FundingRequirement,
    ) -> Result<()> {
        let coin_count = requirement.minimum_coin_object_count.max(1);
        let per_coin = requirement
            .minimum_total_balance
            .div_ceil(coin_count)
            .max(requirement.minimum_single_coin_balance);

        let request = TransactionRequest {
            sender: treasury.address.clone(),
            kind: TransactionKind::PaySplit {
                recipient: target.clone(),
                amounts: vec![per_coin; coin_count as usize],
            },
        };

        let response = self
            .client
            .execute_transaction(&request)
            .await
            .context("treasury transfer submission failed")?;

        if !response.success {
            anyhow::bail!(
                "treasury transfer {} failed: {}",
                response.digest,
                response.error.as_deref().unwrap_or("unknown")
            );
        }

        tracing::debug!(
            digest = %response.digest,
            coins = coin_count,
            per_coin,
            target = %target,
            "Treasury transfer submitted"
        );
        Ok(())
    }

    /// Issue one faucet request per missing coin, each with a bounded
    /// per-request retry loop. Returns the number of successful requests.
    async fn request_from_faucet(
        &self,
        host: &str,
        target: &Address,
        requirement: &FundingRequirement,
        snapshot: &CoinSnapshot,
    ) -> Result<u32> {
        let missing = requirement
            .minimum_coin_object_count
            .saturating_sub(snapshot.coin_count())
            .max(1);

        let http = crate::rpc::create_http_client()?;
        let url = format!("http://{}/gas", host);

        for i in 0..missing {
            let mut attempt_error = None;
            let mut succeeded = false;

            for attempt in 1..=FAUCET_ATTEMPTS {
                match http
                    .post(&url)
                    .json(&FaucetRequest { recipient: target })
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                {
                    Ok(_) => {
                        succeeded = true;
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(attempt, coin = i + 1, error = %err, "Faucet request failed");
                        attempt_error = Some(err);
                        if attempt < FAUCET_ATTEMPTS {
                            tokio::time::sleep(FAUCET_RETRY_DELAY).await;
                        }
                    }
                }
            }

            if !succeeded {
                let err = attempt_error
                    .map(anyhow::Error::new)
                    .unwrap_or_else(|| anyhow::anyhow!("faucet request failed"));
                return Err(err.context(format!(
                    "faucet request {}/{} failed after {} attempts",
                    i + 1,
                    missing,
                    FAUCET_ATTEMPTS
                )));
            }
        }

        tracing::debug!(requests = missing, target = %target, "Faucet requests completed");
        Ok(missing as u32)
    }

    /// Poll the account's coin snapshot until it satisfies the requirement
    /// or the confirmation deadline passes.
    async fn wait_for_confirmation(
        &self,
        target: &Address,
        requirement: &FundingRequirement,
    ) -> Result<()> {
        let start = Instant::now();
        let mut last_error = "confirmation not yet polled".to_string();

        loop {
            match self.client.get_coins(target).await {
                Ok(snapshot) if requirement.is_satisfied_by(&snapshot) => return Ok(()),
                Ok(snapshot) => {
                    last_error = format!(
                        "requirement not yet met (coins: {}, total: {}, largest: {})",
                        snapshot.coin_count(),
                        snapshot.total_balance(),
                        snapshot.largest_coin_balance()
                    );
                }
                Err(err) => last_error = err.to_string(),
            }

            if start.elapsed() > CONFIRMATION_TIMEOUT {
                return Err(HarnessError::Timeout {
                    what: format!("funding confirmation for {}", target),
                    elapsed: start.elapsed(),
                    last_error,
                    log_tail: String::new(),
                }
                .into());
            }

            tokio::time::sleep(CONFIRMATION_INTERVAL).await;
        }
    }
}
