//! Package-manifest editing: registering the ephemeral localnet as an
//! environment.
//!
//! Test packages carry an `[environments]` table mapping environment names
//! to chain ids. The edit is targeted: only the relevant line is touched,
//! everything else in the manifest is preserved byte-for-byte so version
//! control diffs stay minimal.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// Register `name = { chain_id = "<chain_id>" }` under `[environments]`
/// in the manifest at `path`. Creates the table when missing, replaces
/// the entry when it exists with a different chain id, and is a no-op
/// when the entry already matches.
pub fn register_environment(path: &Path, name: &str, chain_id: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .context(format!("failed to read manifest at {}", path.display()))?;

    let updated = register_environment_in(&content, name, chain_id)?;
    if updated == content {
        tracing::debug!(name, chain_id, "Environment already registered in manifest");
        return Ok(());
    }

    std::fs::write(path, updated)
        .context(format!("failed to write manifest at {}", path.display()))?;
    tracing::debug!(name, chain_id, path = %path.display(), "Registered environment in manifest");
    Ok(())
}

/// Pure edit over the manifest text, for the file-backed wrapper above.
fn register_environment_in(content: &str, name: &str, chain_id: &str) -> Result<String> {
    let entry = format!("{name} = {{ chain_id = \"{chain_id}\" }}");

    // An existing entry for this name, whatever its chain id.
    let entry_re = Regex::new(&format!(
        r#"(?m)^{}\s*=\s*\{{[^}}]*\}}[^\S\n]*$"#,
        regex::escape(name)
    ))
    .context("failed to compile environment entry pattern")?;

    let section_re =
        Regex::new(r"(?m)^\[environments\][^\S\n]*$").context("failed to compile section pattern")?;

    let Some(section) = section_re.find(content) else {
        // No table yet: append one, keeping a blank line before it.
        let mut out = content.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.is_empty() && !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str("[environments]\n");
        out.push_str(&entry);
        out.push('\n');
        return Ok(out);
    };

    // Bounds of the [environments] table: from the header to the next
    // section header or end of file.
    let body_start = section.end();
    let body_end = content[body_start..]
        .find("\n[")
        .map(|i| body_start + i + 1)
        .unwrap_or(content.len());
    let body = &content[body_start..body_end];

    if let Some(existing) = entry_re.find(body) {
        if existing.as_str().trim_end() == entry {
            return Ok(content.to_string());
        }
        let mut out = String::with_capacity(content.len());
        out.push_str(&content[..body_start + existing.start()]);
        out.push_str(&entry);
        out.push_str(&content[body_start + existing.end()..]);
        return Ok(out);
    }

    // Insert right after the table header.
    let mut out = String::with_capacity(content.len() + entry.len() + 1);
    out.push_str(&content[..body_start]);
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry);
    out.push('\n');
    out.push_str(content[body_start..].trim_start_matches('\n'));
    Ok(out)
}
