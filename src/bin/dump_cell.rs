//! Cell blob inspector - prints the edits stored in a persisted cell.
//!
//! Usage: cargo run --bin dump_cell -- [OPTIONS] <PATH>
//!
//! Options:
//!   --cell-size <SIZE>   Cell edge length used to decompress (default: 8192)
//!   --raw                Print the quantized records instead

use std::path::{Path, PathBuf};

use terrafeed::cell::CellIndex;
use terrafeed::core::config::DEFAULT_CELL_SIZE;
use terrafeed::store::decode_blob;

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("warn"),
    )
    .format_timestamp_millis()
    .init();

    let args: Vec<String> = std::env::args().collect();
    let cell_size = parse_f32_arg(&args, "--cell-size").unwrap_or(DEFAULT_CELL_SIZE);
    let raw = args.iter().any(|a| a == "--raw");

    let Some(path) = positional_arg(&args) else {
        eprintln!("Usage: dump_cell [--cell-size <SIZE>] [--raw] <PATH>");
        std::process::exit(2);
    };

    let cell = cell_from_path(&path).unwrap_or_default();

    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            std::process::exit(1);
        }
    };

    let edits = match decode_blob(cell, &data) {
        Ok(edits) => edits,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    println!("Cell {} ({} bytes, {} edits)", cell, data.len(), edits.len());
    for (i, record) in edits.iter().enumerate() {
        if raw {
            println!("{:5}: {:?}", i, record);
        } else {
            let edit = record.decompress(cell_size);
            println!(
                "{:5}: {:?} size {:.1} at ({:.2}, {:.2}, {:.2})",
                i, edit.kind, edit.size, edit.origin.x, edit.origin.y, edit.origin.z
            );
        }
    }
}

/// Parse `<x>_<y>` out of a `<x>_<y>.cell` file name
fn cell_from_path(path: &Path) -> Option<CellIndex> {
    let stem = path.file_stem()?.to_str()?;
    let (x, y) = stem.split_once('_')?;
    Some(CellIndex::new(x.parse().ok()?, y.parse().ok()?))
}

fn positional_arg(args: &[String]) -> Option<PathBuf> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--cell-size" => {
                iter.next();
            }
            "--raw" => {}
            other => return Some(PathBuf::from(other)),
        }
    }
    None
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}
