//! Scoped, nestable process-environment overrides.
//!
//! Naive save/restore of a single old value breaks when two logical scopes
//! override the same variable and release out of order. Each override here
//! gets a token; releasing a token removes exactly that entry and
//! re-materializes the new top of stack (or the baseline captured before
//! the first override).
//!
//! Process environment is global state, so one stack instance should be
//! shared by everything that mutates the environment within a process.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::sync::atomic::{AtomicU64, Ordering};

/// The process-wide stack. Everything in the harness that mutates the
/// environment goes through this one instance so overrides interleave
/// correctly.
pub fn shared() -> &'static EnvOverrideStack {
    static SHARED: OnceLock<EnvOverrideStack> = OnceLock::new();
    SHARED.get_or_init(EnvOverrideStack::new)
}

/// Handle identifying one override entry. Releasing it removes that entry
/// regardless of its position in the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideToken {
    key: String,
    id: u64,
}

impl OverrideToken {
    /// The environment variable this token overrides.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
struct KeyStack {
    /// Value of the variable before the first override, if it was set.
    baseline: Option<String>,
    /// Live overrides, oldest first.
    entries: Vec<(u64, String)>,
}

/// Token-based stack of environment-variable overrides.
#[derive(Debug, Default)]
pub struct EnvOverrideStack {
    stacks: Mutex<HashMap<String, KeyStack>>,
    next_id: AtomicU64,
}

/// Set or remove a live environment variable.
///
/// SAFETY: all mutation funnels through the stack's mutex, which is held by
/// every caller in this module; the harness does not read the environment
/// concurrently from other threads while a localnet run is in progress.
fn materialize(key: &str, value: Option<&str>) {
    match value {
        Some(v) => unsafe { std::env::set_var(key, v) },
        None => unsafe { std::env::remove_var(key) },
    }
}

impl EnvOverrideStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an override for `key`, capturing the pre-existing value as the
    /// baseline on first use, and set the live variable to `value`.
    pub fn apply(&self, key: &str, value: &str) -> OverrideToken {
        let mut stacks = self.stacks.lock().unwrap_or_else(|e| e.into_inner());
        let stack = stacks.entry(key.to_string()).or_insert_with(|| KeyStack {
            baseline: std::env::var(key).ok(),
            entries: Vec::new(),
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        stack.entries.push((id, value.to_string()));
        materialize(key, Some(value));

        tracing::trace!(key, value, id, "Applied environment override");
        OverrideToken {
            key: key.to_string(),
            id,
        }
    }

    /// Remove the entry identified by `token` (not necessarily the top) and
    /// set the live variable to the new top of stack, or restore the
    /// baseline and forget the stack if it is now empty.
    pub fn release(&self, token: OverrideToken) {
        let mut stacks = self.stacks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stack) = stacks.get_mut(&token.key) else {
            tracing::warn!(key = %token.key, "Released an override for an unknown key");
            return;
        };

        stack.entries.retain(|(id, _)| *id != token.id);

        match stack.entries.last() {
            Some((_, top)) => materialize(&token.key, Some(top)),
            None => {
                materialize(&token.key, stack.baseline.as_deref());
                stacks.remove(&token.key);
            }
        }
        tracing::trace!(key = %token.key, id = token.id, "Released environment override");
    }

    /// Apply all `updates`, run `action`, and release every override in
    /// reverse order on all exit paths (including panics, via the guard's
    /// `Drop`).
    pub async fn with_env<F, Fut, T>(&self, updates: &[(&str, &str)], action: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.scoped(updates);
        action().await
    }

    /// Apply all `updates` and return a guard that releases them in reverse
    /// order when dropped.
    pub fn scoped<'a>(&'a self, updates: &[(&str, &str)]) -> ScopedEnv<'a> {
        let tokens = updates
            .iter()
            .map(|(key, value)| self.apply(key, value))
            .collect();
        ScopedEnv {
            stack: self,
            tokens,
        }
    }
}

/// Releases its overrides in reverse order on drop.
pub struct ScopedEnv<'a> {
    stack: &'a EnvOverrideStack,
    tokens: Vec<OverrideToken>,
}

impl Drop for ScopedEnv<'_> {
    fn drop(&mut self) {
        while let Some(token) = self.tokens.pop() {
            self.stack.release(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses a unique variable name: the process environment is
    // shared across the test binary's threads.

    #[test]
    fn test_release_in_order() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_IN_ORDER";

        let a = stack.apply(key, "v1");
        let b = stack.apply(key, "v2");
        assert_eq!(std::env::var(key).unwrap(), "v2");

        stack.release(b);
        assert_eq!(std::env::var(key).unwrap(), "v1");
        stack.release(a);
        assert!(std::env::var(key).is_err());
    }

    #[test]
    fn test_release_out_of_order_keeps_newest() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_OUT_OF_ORDER";

        let a = stack.apply(key, "v1");
        let b = stack.apply(key, "v2");

        // Releasing the older entry must leave the newer one live.
        stack.release(a);
        assert_eq!(std::env::var(key).unwrap(), "v2");

        stack.release(b);
        assert!(std::env::var(key).is_err());
    }

    #[test]
    fn test_baseline_restored() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_BASELINE";
        materialize(key, Some("original"));

        let a = stack.apply(key, "v1");
        let b = stack.apply(key, "v2");
        stack.release(b);
        stack.release(a);

        assert_eq!(std::env::var(key).unwrap(), "original");
        materialize(key, None);
    }

    #[test]
    fn test_baseline_survives_out_of_order_release() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_BASELINE_OOO";
        materialize(key, Some("original"));

        let a = stack.apply(key, "v1");
        let b = stack.apply(key, "v2");
        stack.release(a);
        // The variable must never be unset while any override is live.
        assert_eq!(std::env::var(key).unwrap(), "v2");
        stack.release(b);
        assert_eq!(std::env::var(key).unwrap(), "original");
        materialize(key, None);
    }

    #[tokio::test]
    async fn test_with_env_releases_on_success() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_WITH_ENV";

        let observed = stack
            .with_env(&[(key, "scoped")], || async { std::env::var(key).unwrap() })
            .await;

        assert_eq!(observed, "scoped");
        assert!(std::env::var(key).is_err());
    }

    #[test]
    fn test_scoped_guard_releases_on_panic() {
        let stack = EnvOverrideStack::new();
        let key = "LEDGERNET_TEST_ENV_PANIC";

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = stack.scoped(&[(key, "doomed")]);
            panic!("boom");
        }));

        assert!(result.is_err());
        assert!(std::env::var(key).is_err());
    }
}
