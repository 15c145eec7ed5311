//! Cache subcommands.
//!
//! Each command writes its report to `out` so it can run against a buffer in
//! tests.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use shelf_cache::{filter_entries, BlobStore, Cache, CacheEntry, LabeledStore, Labels};
use shelf_config::{log_cli_debug, log_cli_info, log_cli_warn};

/// Parse a `KEY=VALUE` label argument.
pub fn parse_label(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty label key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Read a whole input file, or stdin for `-`.
pub fn read_input(input: &Path) -> Result<Vec<u8>> {
    if input == Path::new("-") {
        let mut buf = Vec::new();
        io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
        return Ok(buf);
    }
    fs::read(input).with_context(|| format!("Failed to read {}", input.display()))
}

pub fn add<S: BlobStore>(
    cache: &mut Cache<S>,
    labels: Vec<(String, String)>,
    body: &[u8],
    aggressive_keys: &[String],
    out: &mut impl Write,
) -> Result<()> {
    let labels: Labels = labels.into_iter().collect();
    let entry = cache.add(labels, body).context("Failed to add object")?;

    if aggressive_keys
        .iter()
        .any(|key| entry.label(key).is_some())
    {
        entry.mark_for_aggressive_release();
    }

    log_cli_info!(
        "Added object",
        object = entry.object_id().as_str(),
        size = body.len(),
    );
    writeln!(out, "{}", entry.object_id())?;
    Ok(())
}

/// List live entries, optionally only those labeled `key` = `value`.
pub fn ls<S: BlobStore>(
    cache: &Cache<S>,
    filter: Option<(&str, &str)>,
    as_json: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut entries = Vec::new();
    cache.find_all(None, "", &mut entries);
    if let Some((key, value)) = filter {
        filter_entries(&mut entries, Some(key), value)?;
    }
    log_cli_debug!("Listing entries", count = entries.len());

    if as_json {
        let rows: Vec<_> = entries.iter().map(|entry| entry_json(entry)).collect();
        serde_json::to_writer_pretty(&mut *out, &rows)?;
        writeln!(out)?;
        return Ok(());
    }

    for entry in entries {
        let size = entry_size(entry).map_or_else(|| "-".to_string(), |len| len.to_string());
        let labels: Vec<String> = entry
            .labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        writeln!(out, "{}\t{}\t{}", entry.object_id(), size, labels.join(" "))?;
    }
    Ok(())
}

/// Body size without mapping; `None` if the object cannot be read.
fn entry_size<S: BlobStore>(entry: &CacheEntry<S>) -> Option<u64> {
    match entry.body_len() {
        Ok(len) => Some(len),
        Err(e) => {
            log_cli_warn!(
                "Unable to size object",
                object = entry.object_id().as_str(),
                error = tracing::field::display(&e),
            );
            None
        }
    }
}

fn entry_json<S: BlobStore>(entry: &CacheEntry<S>) -> serde_json::Value {
    // Pairs rather than an object: keys may repeat.
    let labels: Vec<_> = entry.labels().iter().map(|(k, v)| json!([k, v])).collect();
    json!({
        "object": entry.object_id().as_str(),
        "size": entry_size(entry),
        "labels": labels,
    })
}

/// Write the body of the first entry labeled `key` = `value`.
pub fn cat<S: BlobStore>(
    cache: &Cache<S>,
    key: &str,
    value: &str,
    out: &mut impl Write,
) -> Result<()> {
    let entry = cache
        .find_first(key, value)
        .with_context(|| format!("No entry labeled {key}={value}"))?;
    out.write_all(&entry.body()?)?;
    Ok(())
}

/// Mark every entry labeled `key` = `value` for removal, then sweep.
pub fn rm<S: BlobStore>(
    cache: &mut Cache<S>,
    key: &str,
    value: &str,
    force: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut matches = Vec::new();
    cache.find_all(Some(key), value, &mut matches);
    let marked = matches.len();
    for entry in matches {
        entry.mark_for_removal();
    }

    let report = cache.delete_pending(force);
    for object in &report.failed {
        log_cli_warn!("Object stays on disk", object = object.as_str());
    }
    writeln!(out, "Deleted {} of {} matching entries", report.deleted, marked)?;
    if !report.failed.is_empty() {
        anyhow::bail!("{} objects could not be removed", report.failed.len());
    }
    Ok(())
}

pub fn usage(cache: &Cache<LabeledStore>, out: &mut impl Write) -> Result<()> {
    let store = cache.store();
    let bytes = store.usage()?;
    writeln!(out, "Directory: {}", store.root().display())?;
    writeln!(out, "Objects:   {} / {}", cache.len(), store.max_entries())?;
    writeln!(out, "Bytes:     {}", bytes)?;
    Ok(())
}
