//! Migration of legacy flat-file state into the coordination store.
//!
//! Each source is read and mapped record by record; every record is
//! validated and written on its own, so one bad entry never aborts the
//! batch. Writes are upserts keyed the same way on every run, which makes
//! re-running a migration safe.

pub mod legacy;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::coordination::{CoordinationError, CoordinationStateManager};
use crate::obs;
use legacy::{LegacyFormat, LegacyRecord, MappedRecord};

pub use legacy::{map_event_type, map_status, parse_timestamp};

/// Why a whole source could not be mapped.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is not a recognised legacy format")]
    UnknownFormat { path: PathBuf },
}

/// One record that was not migrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationIssue {
    pub source: String,
    /// Location inside the source, or `*` for the whole file.
    pub record: String,
    pub reason: String,
}

/// Per-source counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub path: String,
    pub format: Option<LegacyFormat>,
    pub migrated: usize,
    pub failed: usize,
}

/// Outcome of a migration batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub records_migrated: usize,
    pub records_failed: usize,
    pub validation_errors: Vec<MigrationIssue>,
    pub dry_run: bool,
    pub sources: Vec<SourceSummary>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.records_failed == 0
    }
}

const WHOLE_SOURCE: &str = "*";
const NOT_PERSISTED: &str = "backing store unavailable";

/// Migrate every source into `manager`.
///
/// With `dry_run` records are mapped and validated but nothing is written;
/// valid records count as migrated. Failures are collected, never raised.
#[instrument(skip(manager, sources), fields(sources = sources.len()))]
pub async fn migrate<P: AsRef<Path>>(
    manager: &CoordinationStateManager,
    sources: &[P],
    dry_run: bool,
) -> MigrationReport {
    let mut report = MigrationReport {
        dry_run,
        ..MigrationReport::default()
    };

    for source in sources {
        let path = source.as_ref();
        let label = path.display().to_string();
        let mut summary = SourceSummary {
            path: label.clone(),
            format: None,
            migrated: 0,
            failed: 0,
        };

        match load_source(path).await {
            Ok((format, records)) => {
                summary.format = Some(format);
                debug!(source = %label, format = %format, records = records.len(), "Mapped legacy source");
                for record in records {
                    match migrate_record(manager, record.mapped, dry_run).await {
                        Ok(()) => summary.migrated += 1,
                        Err(reason) => {
                            summary.failed += 1;
                            report.validation_errors.push(MigrationIssue {
                                source: label.clone(),
                                record: record.label,
                                reason,
                            });
                        }
                    }
                }
            }
            Err(err) => {
                warn!(source = %label, error = %err, "Skipping legacy source");
                summary.failed += 1;
                report.validation_errors.push(MigrationIssue {
                    source: label.clone(),
                    record: WHOLE_SOURCE.into(),
                    reason: err.to_string(),
                });
            }
        }

        report.records_migrated += summary.migrated;
        report.records_failed += summary.failed;
        report.sources.push(summary);
    }

    obs::emit_migration_finished(report.records_migrated, report.records_failed, dry_run);
    report
}

/// Read, detect and map one source file.
pub async fn load_source(path: &Path) -> Result<(LegacyFormat, Vec<LegacyRecord>), MigrationError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(format) = LegacyFormat::from_extension(path) {
        return Ok((format, legacy::parse_event_lines(&contents)));
    }

    let document: serde_json::Value =
        serde_json::from_str(&contents).map_err(|source| MigrationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let format = LegacyFormat::detect(&document).ok_or_else(|| MigrationError::UnknownFormat {
        path: path.to_path_buf(),
    })?;
    Ok((format, legacy::parse_document(format, &document, Utc::now())))
}

async fn migrate_record(
    manager: &CoordinationStateManager,
    mapped: Result<MappedRecord, String>,
    dry_run: bool,
) -> Result<(), String> {
    let record = mapped?;
    if dry_run {
        return Ok(());
    }

    let persisted = match record {
        MappedRecord::Agent(state) => manager
            .import_agent_state(state)
            .await
            .map_err(describe)?
            .persisted,
        MappedRecord::Event(event) => manager
            .import_coordination_event(event)
            .await
            .map_err(describe)?
            .persisted,
        MappedRecord::System(state) => manager.import_system_state(state).await.persisted,
    };
    if persisted {
        Ok(())
    } else {
        Err(NOT_PERSISTED.into())
    }
}

fn describe(err: CoordinationError) -> String {
    err.to_string()
}
