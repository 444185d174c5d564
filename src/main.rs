use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::process;

use cnpj_import::{
    open_database, run_import, setup_database, table_count, FileOutcome, ImportOptions,
};

const TARGET_TABLES: [&str; 7] = [
    "companies",
    "establishments",
    "cnaes",
    "municipalities",
    "legal_natures",
    "motivos_situacao_cadastral",
    "regimes_tributarios",
];

fn main() -> Result<()> {
    let (data_dir, db_path, options) = parse_args()?;

    println!("🗄️  CNPJ Registry Import - delimited dumps → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !data_dir.is_dir() {
        bail!("Data directory {} does not exist", data_dir.display());
    }

    // 1. Setup database
    println!("\n🔧 Setting up database...");
    let mut conn = open_database(&db_path)?;
    setup_database(&conn)?;
    println!(
        "✓ Database initialized with WAL mode at {}",
        db_path.display()
    );

    // 2. Run the import
    println!("\n💾 Importing from {}...", data_dir.display());
    let report = run_import(&mut conn, &data_dir, options)?;

    // 3. Verify counts
    println!("\n🔍 Verifying database...");
    for table in TARGET_TABLES {
        let count = table_count(&conn, table)?;
        println!("✓ {}: {} rows", table, count);
    }

    // 4. Summary
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());

    if !report.is_success() {
        for outcome in &report.outcomes {
            if let FileOutcome::Failed { file, error } = outcome {
                eprintln!("❌ {}: {}", file, error);
            }
        }
        process::exit(1);
    }

    println!("🎉 Import complete!");

    Ok(())
}

fn parse_args() -> Result<(PathBuf, PathBuf, ImportOptions)> {
    let args: Vec<String> = env::args().collect();

    let mut data_dir: Option<PathBuf> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut options = ImportOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" => {
                i += 1;
                let value = args.get(i).context("--limit needs a number")?;
                let limit: usize = value
                    .parse()
                    .with_context(|| format!("Invalid --limit value {:?}", value))?;
                options.row_limit = Some(limit);
            }
            arg if data_dir.is_none() => data_dir = Some(PathBuf::from(arg)),
            arg if db_path.is_none() => db_path = Some(PathBuf::from(arg)),
            arg => bail!("Unexpected argument {:?}", arg),
        }
        i += 1;
    }

    let data_dir = match data_dir {
        Some(dir) => dir,
        None => {
            eprintln!("Usage: cnpj-import <data-dir> [db-path] [--limit N]");
            process::exit(1);
        }
    };

    let db_path = db_path.unwrap_or_else(|| PathBuf::from("cnpj.db"));

    Ok((data_dir, db_path, options))
}
