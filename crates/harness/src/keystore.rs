//! Local key material: the node's keystore files and the test accounts
//! derived for individual tests.
//!
//! The keystore is a JSON array of base64-encoded 32-byte keys, written by
//! the node's genesis. The treasury account is whichever entry holds a
//! positive on-chain balance of the native asset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::error::HarnessError;
use crate::rpc::{Address, LedgerRpcClient};

/// Keystore filenames probed inside the node config directory, in order.
const KEYSTORE_CANDIDATES: &[&str] = &["ledger.keystore", "keystore.json"];

/// Expected length of decoded key material.
const KEY_LEN: usize = 32;

/// A throwaway account with locally-held key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestAccount {
    pub label: String,
    pub key_material: Vec<u8>,
    pub address: Address,
}

impl TestAccount {
    /// Derive an account deterministically from `(test_id, label)`.
    /// Re-running the same test reproduces the same address without any
    /// persistence.
    pub fn derive(test_id: &str, label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(test_id.as_bytes());
        hasher.update(b"/");
        hasher.update(label.as_bytes());
        let key_material = hasher.finalize().to_vec();

        Self {
            label: label.to_string(),
            address: address_for_key(&key_material),
            key_material,
        }
    }

    /// Rebuild an account from raw key material (e.g. a keystore entry).
    pub fn from_key_material(label: &str, key_material: Vec<u8>) -> Self {
        Self {
            label: label.to_string(),
            address: address_for_key(&key_material),
            key_material,
        }
    }

    /// Base64 form of the key material, as stored in the keystore.
    pub fn keystore_entry(&self) -> String {
        BASE64.encode(&self.key_material)
    }
}

/// Address of a key: 0x-prefixed hex of SHA-256 over the key material.
fn address_for_key(key_material: &[u8]) -> Address {
    let digest = Sha256::digest(key_material);
    Address(format!("0x{}", hex::encode(digest)))
}

/// Locate the keystore file inside `config_dir`, if any candidate exists.
pub fn find_keystore(config_dir: &Path) -> Option<PathBuf> {
    KEYSTORE_CANDIDATES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Read all base64 entries from a keystore file.
fn read_entries(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read keystore at {}", path.display()))?;
    serde_json::from_str(&content)
        .context(format!("Failed to parse keystore at {}", path.display()))
}

fn decode_entry(entry: &str) -> Result<Vec<u8>> {
    let bytes = BASE64
        .decode(entry)
        .context("keystore entry is not valid base64")?;
    if bytes.len() != KEY_LEN {
        anyhow::bail!(
            "keystore entry has {} bytes of key material, expected {}",
            bytes.len(),
            KEY_LEN
        );
    }
    Ok(bytes)
}

/// Find the pre-seeded treasury: scan keystore entries, check each
/// address's balance on chain, and return the first one holding a positive
/// balance of the native asset.
///
/// With `override_index` set, that entry is tried first; the remaining
/// entries are still scanned afterwards so a bad override degrades to the
/// default behavior with a warning.
pub async fn resolve_treasury_account<C: LedgerRpcClient>(
    config_dir: &Path,
    client: &C,
    override_index: Option<usize>,
) -> Result<TestAccount> {
    let keystore_path = find_keystore(config_dir).ok_or_else(|| {
        HarnessError::Configuration(format!(
            "no keystore found in {} (tried {})",
            config_dir.display(),
            KEYSTORE_CANDIDATES.join(", ")
        ))
    })?;

    let entries = read_entries(&keystore_path)?;

    let mut order: Vec<usize> = Vec::with_capacity(entries.len());
    if let Some(index) = override_index {
        if index < entries.len() {
            order.push(index);
        } else {
            tracing::warn!(
                index,
                entries = entries.len(),
                "Treasury index override out of range, scanning all entries"
            );
        }
    }
    order.extend((0..entries.len()).filter(|i| Some(*i) != override_index));

    let mut scanned = Vec::new();
    for index in order {
        let key_material = match decode_entry(&entries[index]) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(index, error = %err, "Skipping undecodable keystore entry");
                scanned.push(format!("#{index} <undecodable>"));
                continue;
            }
        };

        let account = TestAccount::from_key_material("treasury", key_material);
        let balance = client
            .get_balance(&account.address)
            .await
            .with_context(|| format!("failed to check balance of keystore entry #{index}"))?;

        if balance > 0 {
            tracing::info!(index, address = %account.address, balance, "Resolved treasury account");
            return Ok(account);
        }
        scanned.push(format!("#{index} {} (balance: {balance})", account.address));
    }

    Err(HarnessError::KeystoreEntryNotFound {
        requested: "treasury (positive native balance)".to_string(),
        available: scanned,
    }
    .into())
}

/// Append a key entry to the keystore, creating the file if needed.
/// Registering an entry that is already present is a no-op.
pub fn register_account(config_dir: &Path, account: &TestAccount) -> Result<()> {
    let path = find_keystore(config_dir)
        .unwrap_or_else(|| config_dir.join(KEYSTORE_CANDIDATES[0]));

    let mut entries = if path.exists() {
        read_entries(&path)?
    } else {
        Vec::new()
    };

    let entry = account.keystore_entry();
    if entries.contains(&entry) {
        tracing::debug!(address = %account.address, "Account already registered in keystore");
        return Ok(());
    }

    entries.push(entry);
    let content = serde_json::to_string_pretty(&entries)
        .context("Failed to serialize keystore entries")?;
    std::fs::write(&path, content)
        .context(format!("Failed to write keystore at {}", path.display()))?;

    tracing::debug!(address = %account.address, path = %path.display(), "Registered account in keystore");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::Value;

    use super::*;
    use crate::rpc::{CoinSnapshot, TransactionRequest, TransactionResponse};

    /// Client answering balance queries from a fixed table.
    struct BalanceTable(Mutex<HashMap<Address, u64>>);

    impl BalanceTable {
        fn new(balances: &[(&TestAccount, u64)]) -> Self {
            Self(Mutex::new(
                balances
                    .iter()
                    .map(|(a, b)| (a.address.clone(), *b))
                    .collect(),
            ))
        }
    }

    impl LedgerRpcClient for BalanceTable {
        async fn get_coins(&self, _owner: &Address) -> Result<CoinSnapshot> {
            Ok(CoinSnapshot::default())
        }
        async fn get_balance(&self, owner: &Address) -> Result<u64> {
            Ok(*self.0.lock().unwrap().get(owner).unwrap_or(&0))
        }
        async fn execute_transaction(
            &self,
            _request: &TransactionRequest,
        ) -> Result<TransactionResponse> {
            anyhow::bail!("not supported")
        }
        async fn get_transaction(&self, _digest: &str) -> Result<TransactionResponse> {
            anyhow::bail!("not supported")
        }
        async fn get_object(&self, _object_id: &str) -> Result<Value> {
            anyhow::bail!("not supported")
        }
        async fn get_latest_checkpoint(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn write_keystore(dir: &Path, accounts: &[&TestAccount]) {
        let entries: Vec<String> = accounts.iter().map(|a| a.keystore_entry()).collect();
        std::fs::write(
            dir.join("ledger.keystore"),
            serde_json::to_string(&entries).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = TestAccount::derive("my-test", "alice");
        let b = TestAccount::derive("my-test", "alice");
        let c = TestAccount::derive("my-test", "bob");
        assert_eq!(a, b);
        assert_ne!(a.address, c.address);
        assert!(a.address.0.starts_with("0x"));
        assert_eq!(a.key_material.len(), KEY_LEN);
    }

    #[tokio::test]
    async fn test_resolve_returns_first_funded_entry() {
        let dir = tempdir::TempDir::new("ledgernet-keystore-test").unwrap();
        let broke = TestAccount::derive("resolve-test", "broke");
        let rich = TestAccount::derive("resolve-test", "rich");
        write_keystore(dir.path(), &[&broke, &rich]);

        let client = BalanceTable::new(&[(&broke, 0), (&rich, 1_000)]);
        let treasury = resolve_treasury_account(dir.path(), &client, None)
            .await
            .unwrap();
        assert_eq!(treasury.address, rich.address);
    }

    #[tokio::test]
    async fn test_resolve_honors_override_index() {
        let dir = tempdir::TempDir::new("ledgernet-keystore-test").unwrap();
        let first = TestAccount::derive("override-test", "first");
        let second = TestAccount::derive("override-test", "second");
        write_keystore(dir.path(), &[&first, &second]);

        // Both are funded; the override picks the second entry.
        let client = BalanceTable::new(&[(&first, 500), (&second, 500)]);
        let treasury = resolve_treasury_account(dir.path(), &client, Some(1))
            .await
            .unwrap();
        assert_eq!(treasury.address, second.address);
    }

    #[tokio::test]
    async fn test_resolve_error_lists_scanned_candidates() {
        let dir = tempdir::TempDir::new("ledgernet-keystore-test").unwrap();
        let a = TestAccount::derive("empty-test", "a");
        let b = TestAccount::derive("empty-test", "b");
        write_keystore(dir.path(), &[&a, &b]);

        let client = BalanceTable::new(&[(&a, 0), (&b, 0)]);
        let err = resolve_treasury_account(dir.path(), &client, None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&a.address.0));
        assert!(msg.contains(&b.address.0));
        assert!(msg.contains("balance: 0"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let dir = tempdir::TempDir::new("ledgernet-keystore-test").unwrap();
        let account = TestAccount::derive("register-test", "alice");

        register_account(dir.path(), &account).unwrap();
        register_account(dir.path(), &account).unwrap();

        let path = find_keystore(dir.path()).unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], account.keystore_entry());
    }

    #[tokio::test]
    async fn test_register_appends_to_existing_keystore() {
        let dir = tempdir::TempDir::new("ledgernet-keystore-test").unwrap();
        let genesis = TestAccount::derive("append-test", "genesis");
        write_keystore(dir.path(), &[&genesis]);

        let extra = TestAccount::derive("append-test", "extra");
        register_account(dir.path(), &extra).unwrap();

        let path = find_keystore(dir.path()).unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
