//! `size` - table sizes and row counts from system.parts.

use anyhow::Result;
use clickhouse::Row;
use serde::Deserialize;

use crate::ch;

#[derive(Debug, Row, Deserialize)]
struct TableSizeRow {
    table: String,
    rows: u64,
    bytes: u64,
}

pub async fn run_size() -> Result<()> {
    let client = ch::connect().await?;

    let tables = client
        .query(
            "SELECT table, sum(rows) AS rows, sum(bytes_on_disk) AS bytes
             FROM system.parts
             WHERE active AND database = currentDatabase()
             GROUP BY table
             ORDER BY bytes DESC",
        )
        .fetch_all::<TableSizeRow>()
        .await?;

    if tables.is_empty() {
        println!("No tables with data found");
        return Ok(());
    }

    println!("{:<32} {:>16} {:>12}", "table", "rows", "on disk");
    let mut total_rows = 0u64;
    let mut total_bytes = 0u64;
    for t in &tables {
        println!(
            "{:<32} {:>16} {:>12}",
            t.table,
            t.rows,
            format_bytes(t.bytes)
        );
        total_rows += t.rows;
        total_bytes += t.bytes;
    }
    println!(
        "{:<32} {:>16} {:>12}",
        "total",
        total_rows,
        format_bytes(total_bytes)
    );

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_render_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }
}
