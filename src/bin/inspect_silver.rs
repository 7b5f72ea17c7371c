use anyhow::{Context, Result};
use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use parquet::file::reader::{FileReader, SerializedFileReader};
use silverstage::write::{part_files, read_output};
use std::{fs::File, path::PathBuf};

#[derive(Parser)]
#[command(author, version, about = "Print schema, parts and a preview of one silver table")]
struct Args {
    /// Output directory of one entity, e.g. ./silver/Sales
    dir: PathBuf,

    /// Rows to preview
    #[arg(short, long, default_value_t = 10)]
    rows: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let parts = part_files(&args.dir)
        .with_context(|| format!("listing parts in {}", args.dir.display()))?;

    println!("=== Silver table: {} ===", args.dir.display());
    println!("Parts: {}", parts.len());
    for path in &parts {
        let reader = SerializedFileReader::new(File::open(path)?)?;
        let meta = reader.metadata();
        let compression = meta
            .row_groups()
            .first()
            .and_then(|rg| rg.columns().first())
            .map(|c| format!("{:?}", c.compression()))
            .unwrap_or_else(|| "<none>".into());
        println!(
            "- {:<40} rows: {:<8} row groups: {:<3} compression: {}",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            meta.file_metadata().num_rows(),
            meta.num_row_groups(),
            compression
        );
    }
    println!();

    let batch = read_output(&args.dir)?;
    println!("=== Schema ===");
    for field in batch.schema().fields() {
        println!("- {:<30} | {:?}", field.name(), field.data_type());
    }
    println!();

    println!("Total rows: {}", batch.num_rows());
    let preview = batch.slice(0, args.rows.min(batch.num_rows()));
    println!("{}", pretty_format_batches(&[preview])?);
    Ok(())
}
