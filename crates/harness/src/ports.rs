//! Dynamic port allocation and config-text port rewriting.
//!
//! Ports are obtained by binding port 0 on loopback and immediately
//! releasing the listener. The window between release and the node process
//! re-binding is accepted; the exclusion set only guards against the
//! harness handing the same port out twice within one process.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Mutex, OnceLock};

use anyhow::Result;
use regex::{Captures, Regex};

use crate::error::HarnessError;

/// A set of mutually distinct ephemeral loopback ports for one node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    /// JSON-RPC port.
    pub rpc_port: u16,
    /// Auxiliary (metrics/admin) port.
    pub aux_port: u16,
    /// Faucet port, when the faucet sidecar is requested.
    pub faucet_port: Option<u16>,
}

impl PortSet {
    /// All ports in the set, in declaration order.
    pub fn all(&self) -> Vec<u16> {
        let mut ports = vec![self.rpc_port, self.aux_port];
        ports.extend(self.faucet_port);
        ports
    }

    /// True when no port appears in both sets.
    pub fn is_disjoint_from(&self, other: &PortSet) -> bool {
        let mine: HashSet<u16> = self.all().into_iter().collect();
        other.all().iter().all(|p| !mine.contains(p))
    }
}

/// Ports handed out by this process, never reused across harness instances.
fn exclusion_set() -> &'static Mutex<HashSet<u16>> {
    static EXCLUDED: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    EXCLUDED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Ask the OS for a free loopback port and record it in the exclusion set.
///
/// Re-rolls when the OS hands back a port this process already claimed
/// (possible once a previously-claimed listener has been released).
fn allocate_one() -> Result<u16> {
    const MAX_ROLLS: usize = 64;

    for _ in 0..MAX_ROLLS {
        let listener =
            TcpListener::bind(("127.0.0.1", 0)).map_err(HarnessError::from_bind_error)?;
        let port = listener
            .local_addr()
            .map_err(|e| anyhow::Error::new(e).context("failed to read bound address"))?
            .port();
        drop(listener);

        let mut excluded = exclusion_set().lock().unwrap_or_else(|e| e.into_inner());
        if excluded.insert(port) {
            return Ok(port);
        }
    }

    anyhow::bail!("could not find an unused loopback port after {} attempts", MAX_ROLLS)
}

/// Allocate a [`PortSet`] of distinct ephemeral loopback ports.
pub fn allocate_ports(need_faucet_port: bool) -> Result<PortSet> {
    let rpc_port = allocate_one()?;
    let aux_port = allocate_one()?;
    let faucet_port = if need_faucet_port {
        Some(allocate_one()?)
    } else {
        None
    };

    let set = PortSet {
        rpc_port,
        aux_port,
        faucet_port,
    };
    tracing::debug!(rpc = set.rpc_port, aux = set.aux_port, faucet = ?set.faucet_port, "Allocated localnet ports");
    Ok(set)
}

/// Matches the three literal-port shapes found in node config text:
/// `host:port` pairs, transport addresses with a `/tcp/<port>` segment, and
/// bare `some-port: <port>` YAML fields.
fn port_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?m)(?P<prefix>^\s*[A-Za-z0-9_-]*port[A-Za-z0-9_-]*\s*:\s+|/tcp/|[A-Za-z0-9_.\-]+:)(?P<port>\d{1,5})\b",
        )
        .unwrap()
    })
}

/// Rewrite every literal port found in `text` according to `remap`, in a
/// single pass. Ports absent from the remap pass through byte-for-byte, so
/// re-running the patch on already-patched text is a no-op.
pub fn patch_config_text(text: &str, remap: &HashMap<u16, u16>) -> String {
    port_pattern()
        .replace_all(text, |caps: &Captures<'_>| {
            let prefix = &caps["prefix"];
            match caps["port"].parse::<u16>().ok().and_then(|p| remap.get(&p)) {
                Some(new_port) => format!("{}{}", prefix, new_port),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_ports_are_distinct() {
        let set = allocate_ports(true).unwrap();
        let faucet = set.faucet_port.unwrap();
        assert_ne!(set.rpc_port, set.aux_port);
        assert_ne!(set.rpc_port, faucet);
        assert_ne!(set.aux_port, faucet);
    }

    #[test]
    fn test_sequential_allocations_never_overlap() {
        let first = allocate_ports(true).unwrap();
        let second = allocate_ports(true).unwrap();
        assert!(first.is_disjoint_from(&second));
    }

    #[test]
    fn test_patch_host_port_pairs() {
        let text = "rpc-address: 127.0.0.1:9000\nmetrics-address: 0.0.0.0:9184\n";
        let remap = HashMap::from([(9000, 4242), (9184, 4243)]);
        let patched = patch_config_text(text, &remap);
        assert_eq!(
            patched,
            "rpc-address: 127.0.0.1:4242\nmetrics-address: 0.0.0.0:4243\n"
        );
    }

    #[test]
    fn test_patch_transport_address() {
        let text = "listen-address: /ip4/127.0.0.1/tcp/9000/http\n";
        let remap = HashMap::from([(9000, 5555)]);
        assert_eq!(
            patch_config_text(text, &remap),
            "listen-address: /ip4/127.0.0.1/tcp/5555/http\n"
        );
    }

    #[test]
    fn test_patch_bare_port_field() {
        let text = "json-rpc-port: 9000\nfaucet-port: 5003\n";
        let remap = HashMap::from([(9000, 4242)]);
        let patched = patch_config_text(text, &remap);
        assert!(patched.contains("json-rpc-port: 4242"));
        // 5003 is not in the remap and must pass through untouched.
        assert!(patched.contains("faucet-port: 5003"));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let text = "rpc-address: 127.0.0.1:9000\nepoch-duration-ms: 9000\n";
        let remap = HashMap::from([(9000, 4242)]);
        let once = patch_config_text(text, &remap);
        // 4242 is not a key in the remap, so a second pass changes nothing.
        assert_eq!(patch_config_text(&once, &remap), once);
    }

    #[test]
    fn test_unrelated_numbers_untouched() {
        let text = "checkpoint-interval: 30\ngas-budget: 50000000\n";
        let remap = HashMap::from([(9000, 4242)]);
        assert_eq!(patch_config_text(text, &remap), text);
    }
}
