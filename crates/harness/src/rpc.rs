//! Ledger RPC client: the capability interface the harness needs from the
//! node, plus the JSON-RPC implementation used against a live localnet.
//!
//! The harness treats the protocol as opaque; tests substitute an
//! in-memory implementation of [`LedgerRpcClient`].

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An account address on the ledger (0x-prefixed hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One coin object held by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub object_id: String,
    pub balance: u64,
}

/// Coin holdings of an account at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CoinSnapshot {
    pub coins: Vec<Coin>,
}

impl CoinSnapshot {
    pub fn total_balance(&self) -> u64 {
        self.coins.iter().map(|c| c.balance).sum()
    }

    pub fn coin_count(&self) -> u64 {
        self.coins.len() as u64
    }

    pub fn largest_coin_balance(&self) -> u64 {
        self.coins.iter().map(|c| c.balance).max().unwrap_or(0)
    }
}

/// Transaction payloads the harness submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransactionKind {
    /// Split the sender's gas into `amounts` coins and transfer them all
    /// to `recipient`.
    PaySplit {
        recipient: Address,
        amounts: Vec<u64>,
    },
    /// Publish compiled package modules (base64).
    Publish { modules: Vec<String> },
    /// Call an entry function of a published package.
    Call {
        package: String,
        function: String,
        args: Vec<Value>,
    },
}

/// A transaction request signed implicitly by the node's local key
/// material for `sender`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub sender: Address,
    #[serde(flatten)]
    pub kind: TransactionKind,
}

/// Result of submitting or querying a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub digest: String,
    /// True once the transaction executed successfully.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The read/write capabilities the harness requires from a ledger node.
pub trait LedgerRpcClient: Send + Sync {
    /// Coin objects of the native asset held by `owner`.
    fn get_coins(&self, owner: &Address) -> impl Future<Output = Result<CoinSnapshot>> + Send;

    /// Aggregate native-asset balance of `owner`.
    fn get_balance(&self, owner: &Address) -> impl Future<Output = Result<u64>> + Send;

    /// Submit a transaction and wait for its execution result.
    fn execute_transaction(
        &self,
        request: &TransactionRequest,
    ) -> impl Future<Output = Result<TransactionResponse>> + Send;

    /// Look up a previously-submitted transaction with its effects.
    fn get_transaction(
        &self,
        digest: &str,
    ) -> impl Future<Output = Result<TransactionResponse>> + Send;

    /// Fetch an object by id as raw JSON.
    fn get_object(&self, object_id: &str) -> impl Future<Output = Result<Value>> + Send;

    /// Sequence number of the latest checkpoint. Cheap, used as the
    /// readiness probe.
    fn get_latest_checkpoint(&self) -> impl Future<Output = Result<u64>> + Send;
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &Url,
    method: &str,
    params: Vec<Value>,
) -> Result<T> {
    let response = client
        .post(url.clone())
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", method))?;

    let result: Value = response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", method))?;

    if let Some(error) = result.get("error") {
        anyhow::bail!(
            "RPC error: {}",
            error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown")
        );
    }

    let result_value = result
        .get("result")
        .context("No result in response")?
        .clone();

    serde_json::from_value(result_value)
        .with_context(|| format!("Failed to deserialize {} result", method))
}

/// Wire shape of one coin in `ledger_getCoins`. Balances come back as
/// decimal strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoinJson {
    object_id: String,
    balance: String,
}

/// Wire shape of `ledger_getBalance`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceJson {
    total_balance: String,
}

fn parse_amount(raw: &str, what: &str) -> Result<u64> {
    raw.parse::<u64>()
        .with_context(|| format!("Failed to parse {} amount '{}'", what, raw))
}

/// JSON-RPC implementation of [`LedgerRpcClient`] against a node endpoint.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    url: Url,
}

impl HttpLedgerClient {
    pub fn new(url: Url) -> Result<Self> {
        Ok(Self {
            client: create_http_client()?,
            url,
        })
    }

    /// The node endpoint this client talks to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl LedgerRpcClient for HttpLedgerClient {
    async fn get_coins(&self, owner: &Address) -> Result<CoinSnapshot> {
        let coins: Vec<CoinJson> = json_rpc_call(
            &self.client,
            &self.url,
            "ledger_getCoins",
            vec![serde_json::json!(owner)],
        )
        .await?;

        let coins = coins
            .into_iter()
            .map(|c| {
                Ok(Coin {
                    balance: parse_amount(&c.balance, "coin")?,
                    object_id: c.object_id,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(CoinSnapshot { coins })
    }

    async fn get_balance(&self, owner: &Address) -> Result<u64> {
        let balance: BalanceJson = json_rpc_call(
            &self.client,
            &self.url,
            "ledger_getBalance",
            vec![serde_json::json!(owner)],
        )
        .await?;
        parse_amount(&balance.total_balance, "balance")
    }

    async fn execute_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<TransactionResponse> {
        json_rpc_call(
            &self.client,
            &self.url,
            "ledger_executeTransaction",
            vec![serde_json::json!(request)],
        )
        .await
    }

    async fn get_transaction(&self, digest: &str) -> Result<TransactionResponse> {
        json_rpc_call(
            &self.client,
            &self.url,
            "ledger_getTransaction",
            vec![serde_json::json!(digest)],
        )
        .await
    }

    async fn get_object(&self, object_id: &str) -> Result<Value> {
        json_rpc_call(
            &self.client,
            &self.url,
            "ledger_getObject",
            vec![serde_json::json!(object_id)],
        )
        .await
    }

    async fn get_latest_checkpoint(&self) -> Result<u64> {
        let seq: String = json_rpc_call(
            &self.client,
            &self.url,
            "ledger_getLatestCheckpoint",
            vec![],
        )
        .await?;
        parse_amount(&seq, "checkpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_aggregates() {
        let snapshot = CoinSnapshot {
            coins: vec![
                Coin {
                    object_id: "0x1".to_string(),
                    balance: 100,
                },
                Coin {
                    object_id: "0x2".to_string(),
                    balance: 250,
                },
            ],
        };
        assert_eq!(snapshot.total_balance(), 350);
        assert_eq!(snapshot.coin_count(), 2);
        assert_eq!(snapshot.largest_coin_balance(), 250);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = CoinSnapshot::default();
        assert_eq!(snapshot.total_balance(), 0);
        assert_eq!(snapshot.largest_coin_balance(), 0);
    }

    #[test]
    fn test_transaction_request_serialization() {
        let request = TransactionRequest {
            sender: Address("0xaa".to_string()),
            kind: TransactionKind::PaySplit {
                recipient: Address("0xbb".to_string()),
                amounts: vec![500, 500],
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["sender"], "0xaa");
        assert_eq!(json["kind"], "paySplit");
        assert_eq!(json["amounts"][1], 500);
    }
}
