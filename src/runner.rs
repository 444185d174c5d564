// 📦 Import Runner - one pass over a data directory
// Dispatches every recognized file to its loader and collects per-file
// outcomes: a bad file is recorded and skipped, never allowed to stop
// the rest of the run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::establishments::{import_base_file, BASE_FILE_NAME};
use crate::reference::{import_reference_file, REFERENCE_SOURCES};
use crate::regimes::{import_regime_file, regime_source_for};

// ============================================================================
// RUN OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Cap on usable entity-dump rows (None = unlimited)
    pub row_limit: Option<usize>,
}

// ============================================================================
// PER-FILE OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileOutcome {
    /// File parsed and merged into its table
    Loaded {
        file: String,
        table: String,
        rows: usize,
        skipped: usize,
    },

    /// File aborted; its table is unchanged
    Failed { file: String, error: String },
}

impl FileOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FileOutcome::Failed { .. })
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub outcomes: Vec<FileOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ImportReport {
    pub fn loaded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_failure()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    pub fn rows_loaded(&self) -> usize {
        self.outcomes
            .iter()
            .map(|outcome| match outcome {
                FileOutcome::Loaded { rows, .. } => *rows,
                FileOutcome::Failed { .. } => 0,
            })
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn summary(&self) -> String {
        let elapsed = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        format!(
            "Import finished in {:.1}s: {} loads succeeded, {} failed, {} rows loaded",
            elapsed,
            self.loaded_count(),
            self.failed_count(),
            self.rows_loaded()
        )
    }
}

// ============================================================================
// THE RUN
// ============================================================================

/// Import everything recognizable in `data_dir`: the entity dump, the
/// lookup files, and every file matching the regime dispatch table
/// (sorted by name). Absent files are skipped; present-but-bad files are
/// recorded as failures and the run continues.
pub fn run_import(
    conn: &mut Connection,
    data_dir: &Path,
    options: ImportOptions,
) -> Result<ImportReport> {
    let started_at = Utc::now();
    let mut outcomes = Vec::new();

    // ==========================================================================
    // Entity dump → companies + establishments
    // ==========================================================================
    let base_path = data_dir.join(BASE_FILE_NAME);
    if base_path.exists() {
        println!("📄 Loading {}...", BASE_FILE_NAME);
        match import_base_file(conn, &base_path, options.row_limit) {
            Ok(stats) => {
                println!(
                    "   ✓ {} companies, {} establishments ({} rows skipped)",
                    stats.companies, stats.establishments, stats.skipped_rows
                );
                outcomes.push(FileOutcome::Loaded {
                    file: BASE_FILE_NAME.to_string(),
                    table: "companies".to_string(),
                    rows: stats.companies,
                    skipped: 0,
                });
                outcomes.push(FileOutcome::Loaded {
                    file: BASE_FILE_NAME.to_string(),
                    table: "establishments".to_string(),
                    rows: stats.establishments,
                    skipped: stats.skipped_rows,
                });
            }
            Err(e) => {
                println!("   ✗ {}: {:#}", BASE_FILE_NAME, e);
                outcomes.push(FileOutcome::Failed {
                    file: BASE_FILE_NAME.to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    } else {
        println!("   - {} not present, skipping", BASE_FILE_NAME);
    }

    // ==========================================================================
    // Lookup files → one table each
    // ==========================================================================
    for source in REFERENCE_SOURCES {
        let path = data_dir.join(source.file_name);
        if !path.exists() {
            println!("   - {} not present, skipping", source.file_name);
            continue;
        }

        println!("📄 Loading {}...", source.file_name);
        match import_reference_file(conn, &path, source.table) {
            Ok(rows) => {
                println!("   ✓ {} rows into {}", rows, source.table);
                outcomes.push(FileOutcome::Loaded {
                    file: source.file_name.to_string(),
                    table: source.table.to_string(),
                    rows,
                    skipped: 0,
                });
            }
            Err(e) => {
                println!("   ✗ {}: {:#}", source.file_name, e);
                outcomes.push(FileOutcome::Failed {
                    file: source.file_name.to_string(),
                    error: format!("{:#}", e),
                });
            }
        }
    }

    // ==========================================================================
    // Regime files → regimes_tributarios (discovered by filename pattern)
    // ==========================================================================
    for (name, path, default_label) in discover_regime_files(data_dir)? {
        println!("📄 Loading {}...", name);
        match import_regime_file(conn, &path, default_label) {
            Ok(rows) => {
                println!("   ✓ {} rows into regimes_tributarios", rows);
                outcomes.push(FileOutcome::Loaded {
                    file: name,
                    table: "regimes_tributarios".to_string(),
                    rows,
                    skipped: 0,
                });
            }
            Err(e) => {
                println!("   ✗ {}: {:#}", name, e);
                outcomes.push(FileOutcome::Failed {
                    file: name,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    Ok(ImportReport {
        outcomes,
        started_at,
        finished_at: Utc::now(),
    })
}

/// Every .csv in the directory whose name matches the regime dispatch
/// table, sorted by name so multi-file patterns load deterministically.
fn discover_regime_files(
    data_dir: &Path,
) -> Result<Vec<(String, PathBuf, Option<&'static str>)>> {
    let entries = fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read data directory {}", data_dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !is_csv {
            continue;
        }

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(source) = regime_source_for(name) {
                files.push((name.to_string(), path.clone(), source.default_label));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}
