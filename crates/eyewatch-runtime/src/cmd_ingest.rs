//! `eyewatch ingest` / `eyewatch register`: offline writes straight into the
//! database file, for seeding and for trackers that produce NDJSON dumps.

use std::io::BufRead;

use anyhow::Context;

use eyewatch_core::{DeviceId, Namespace, TelemetryCategory};
use eyewatch_store::{SqliteStore, TelemetryStore};

use crate::cli::{IngestOpts, RegisterOpts};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IngestReport {
    pub inserted: usize,
    pub skipped: usize,
}

/// Resolve the target collection. `cheating_devices` addresses the global
/// collection; everything else is a per-device telemetry category.
pub(crate) fn target_namespace(category: &str, device: &DeviceId) -> anyhow::Result<Namespace> {
    let normalized = category.trim().to_ascii_lowercase().replace('-', "_");
    if normalized == Namespace::CHEATING_DEVICES {
        return Ok(Namespace::cheating_devices());
    }
    let category: TelemetryCategory = category.parse()?;
    Ok(Namespace::telemetry(device, category))
}

/// Insert one document per non-blank line. Lines that are not JSON objects
/// are skipped and logged.
pub(crate) fn ingest_lines<S, R>(
    store: &S,
    namespace: &Namespace,
    reader: R,
) -> anyhow::Result<IngestReport>
where
    S: TelemetryStore + ?Sized,
    R: BufRead,
{
    let mut report = IngestReport::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: serde_json::Value = match serde_json::from_str(&line) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(line = index + 1, "skipping invalid JSON: {e}");
                report.skipped += 1;
                continue;
            }
        };
        match store.insert(namespace, doc) {
            Ok(_) => report.inserted += 1,
            Err(eyewatch_store::StoreError::InvalidDocument(kind)) => {
                tracing::warn!(line = index + 1, "skipping {kind}: documents must be objects");
                report.skipped += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to insert line {}", index + 1));
            }
        }
    }
    Ok(report)
}

pub fn cmd_ingest(opts: &IngestOpts) -> anyhow::Result<()> {
    let device = DeviceId::parse(&opts.mac_address)?;
    let namespace = target_namespace(&opts.category, &device)?;
    let db_path = opts.db.resolve();
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;

    let report = if opts.input.as_os_str() == "-" {
        ingest_lines(&store, &namespace, std::io::stdin().lock())?
    } else {
        let file = std::fs::File::open(&opts.input)
            .with_context(|| format!("failed to open {}", opts.input.display()))?;
        ingest_lines(&store, &namespace, std::io::BufReader::new(file))?
    };

    tracing::info!(
        %namespace,
        inserted = report.inserted,
        skipped = report.skipped,
        "ingest finished"
    );
    println!(
        "inserted {} document(s) into {namespace}, skipped {}",
        report.inserted, report.skipped
    );
    Ok(())
}

pub fn cmd_register(opts: &RegisterOpts) -> anyhow::Result<()> {
    let device = DeviceId::parse(&opts.mac_address)?;
    let db_path = opts.db.resolve();
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    if store.register_device(&device)? {
        println!("registered {device}");
    } else {
        println!("{device} was already registered");
    }
    Ok(())
}
