//! Loading and rendering of the SQL-defined indexers.
//!
//! Two parameter mechanisms co-exist. Granular metrics are rendered by text
//! substitution with an ordered token list; incremental indexers combine a
//! `{chain_id}` text token for SELECT clauses with server-side `{name:Type}`
//! binds for WHERE clauses. Substitution order is load-bearing: specific
//! patterns must be replaced before generic ones (`toStartOf{granularity}`
//! before `{granularity}`), because the generic token is a substring of the
//! specific one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clickhouse::Client;

/// Reads an indexer definition relative to the SQL root.
pub fn load_sql(root: &Path, relative: &str) -> Result<String> {
    let path = root.join(relative);
    std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read SQL file {}", path.display()))
}

/// Applies the replacements in the given order. Callers own the ordering.
pub fn substitute(sql: &str, params: &[(&str, String)]) -> String {
    let mut rendered = sql.to_string();
    for (pattern, value) in params {
        rendered = rendered.replace(pattern, value);
    }
    rendered
}

/// Executes a rendered file statement by statement.
pub async fn execute_statements(client: &Client, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        client
            .query(statement)
            .execute()
            .await
            .with_context(|| format!("statement failed: {}", first_line(statement)))?;
    }
    Ok(())
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement).trim()
}

/// Lists the indexer names (file stems) in a directory, sorted for a stable
/// processing order. A missing directory is an empty population.
pub fn discover_sql_files(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()))
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let path: PathBuf = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sql") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_tokens_render_before_generic_ones() {
        let sql = "SELECT toStartOf{granularity}(block_time), '{granularity}' AS g";
        let params = [
            ("toStartOf{granularity}", "toStartOfDay".to_string()),
            ("_{granularity}", "_day".to_string()),
            ("{granularity}", "day".to_string()),
        ];

        assert_eq!(
            substitute(sql, &params),
            "SELECT toStartOfDay(block_time), 'day' AS g"
        );
    }

    #[test]
    fn reversed_order_corrupts_the_function_name() {
        // The ordering above is not cosmetic. Replacing the generic token
        // first eats the inside of the specific one.
        let sql = "SELECT toStartOf{granularity}(block_time)";
        let params = [
            ("{granularity}", "day".to_string()),
            ("toStartOf{granularity}", "toStartOfDay".to_string()),
        ];

        assert_eq!(substitute(sql, &params), "SELECT toStartOfday(block_time)");
    }

    #[test]
    fn underscore_variant_stays_intact() {
        let sql = "INSERT INTO metrics_{granularity} SELECT '{granularity}'";
        let params = [
            ("_{granularity}", "_hour".to_string()),
            ("{granularity}", "hour".to_string()),
        ];

        assert_eq!(
            substitute(sql, &params),
            "INSERT INTO metrics_hour SELECT 'hour'"
        );
    }

    #[test]
    fn discovery_lists_sorted_stems() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tx_count.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("active_addresses.sql"), "SELECT 1").unwrap();
        std::fs::write(dir.path().join("README.md"), "not sql").unwrap();

        let names = discover_sql_files(dir.path()).unwrap();
        assert_eq!(names, vec!["active_addresses", "tx_count"]);
    }

    #[test]
    fn discovery_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let names = discover_sql_files(&dir.path().join("nope")).unwrap();
        assert!(names.is_empty());
    }
}
