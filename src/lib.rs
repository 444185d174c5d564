// CNPJ Registry Import - Core Library
// Exposes all modules for use in the CLI and tests

pub mod batch;          // Column-named row batches
pub mod db;             // Schema setup + store helpers
pub mod upsert;         // Staging-merge primitive
pub mod reference;      // Lookup-file loader
pub mod establishments; // Entity-dump loader (companies + establishments)
pub mod regimes;        // Tax-regime loader (3/4-column reconciliation)
pub mod runner;         // Directory-level orchestration

// Re-export commonly used types
pub use batch::Batch;
pub use db::{open_database, quote_ident, setup_database, table_count};
pub use establishments::{
    company_batch, import_base_file, parse_base, BaseImportStats, Establishment, ParsedBase,
    BASE_FILE_NAME, ESTABLISHMENT_COLUMNS, ESTABLISHMENT_KEY,
};
pub use reference::{
    import_reference_file, parse_reference, ReferenceRecord, ReferenceSource, REFERENCE_SOURCES,
};
pub use regimes::{
    import_regime_file, parse_regime, regime_source_for, sniff_delimiter, RegimeLayout,
    RegimeSource, TaxRegimeRecord, REGIME_COLUMNS, REGIME_KEY, REGIME_SOURCES,
};
pub use runner::{run_import, FileOutcome, ImportOptions, ImportReport};
pub use upsert::upsert_batch;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
