use anyhow::Result;
use arrow::array::Array;
use condomstudy::load::{load_extract, LabeledTable};
use std::{env, path::Path, process::exit};

fn main() {
    // Expect exactly one CLI argument: path to a Parquet or CSV extract.
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <EXTRACT_FILE>", args[0]);
        exit(1);
    }
    if let Err(e) = inspect_extract(Path::new(&args[1])) {
        eprintln!("Error: {:#}", e);
        exit(1);
    }
}

/// Load the extract and print schema, row count and value labels.
fn inspect_extract(path: &Path) -> Result<()> {
    // 1) Load through the same reader the analysis uses.
    let table = load_extract(path, "extract")?;

    println!("=== Extract: {} ===", path.display());
    println!("Total rows:           {}", table.num_rows());
    println!("Number of columns:    {}", table.batch.num_columns());
    println!();

    // 2) Columns with type, nulls and variable label
    println!("=== Columns ===");
    for (field, col) in table.schema().fields().iter().zip(table.batch.columns()) {
        println!(
            "- {:<20} | Type: {:<10} | Nulls: {:<8} | Label: {}",
            field.name(),
            format!("{}", field.data_type()),
            col.null_count(),
            table.labels.variable_label(field.name()).unwrap_or("<none>")
        );
    }
    println!();

    // 3) Value labels
    print_value_labels(&table);
    Ok(())
}

fn print_value_labels(table: &LabeledTable) {
    println!("=== Value labels ===");
    let mut any = false;
    for field in table.schema().fields() {
        let Some(map) = table.labels.value_map(field.name()) else {
            continue;
        };
        any = true;
        println!("  > {}", field.name());
        for (code, label) in map {
            println!("      {:>4} = {}", code, label);
        }
    }
    if !any {
        println!("  <none>");
    }
}
