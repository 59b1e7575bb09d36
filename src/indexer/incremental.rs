//! Block-range incremental indexers: batched (5-minute throttle) and
//! immediate (sub-second pacing), both advancing a block-number watermark
//! over inclusive ranges.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::indexer::runner::IndexRunner;
use crate::indexer::sqlfile::{load_sql, substitute};
use crate::indexer::watermarks::{save_watermark, watermark_key};

/// Cap on blocks per invocation. Bounds memory for ranges with dense event
/// traffic; the backlog drains across successive invocations.
pub const INCREMENTAL_BATCH_SIZE: u64 = 20_000;

pub const BATCHED_MIN_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const IMMEDIATE_MIN_INTERVAL: Duration = Duration::from_millis(900);

/// While catching up, the watermark is persisted at most once a second; the
/// in-memory copy always advances.
const WATERMARK_SAVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalKind {
    Batched,
    Immediate,
}

impl IncrementalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncrementalKind::Batched => "batched",
            IncrementalKind::Immediate => "immediate",
        }
    }

    pub fn min_interval(&self) -> Duration {
        match self {
            IncrementalKind::Batched => BATCHED_MIN_INTERVAL,
            IncrementalKind::Immediate => IMMEDIATE_MIN_INTERVAL,
        }
    }
}

/// The next inclusive range to process, or None when caught up.
pub fn plan_range(last_block: u64, latest: u64, cap: u64) -> Option<(u64, u64)> {
    if latest <= last_block {
        return None;
    }
    let from = last_block + 1;
    let to = latest.min(last_block.saturating_add(cap));
    Some((from, to))
}

/// Running-state projections that must read their own prior output are
/// declared per-block by filename and advance one block at a time.
pub fn batch_cap_for(indexer_file: &str) -> u64 {
    if indexer_file.ends_with("_per_block") {
        1
    } else {
        INCREMENTAL_BATCH_SIZE
    }
}

impl IndexRunner {
    pub(super) async fn process_incrementals(&mut self, kind: IncrementalKind) {
        let files = match kind {
            IncrementalKind::Batched => self.batched_indexers.clone(),
            IncrementalKind::Immediate => self.immediate_indexers.clone(),
        };
        let latest = self.latest_block_num;

        for file in files {
            let indexer_name = format!(
                "{}/{}/{file}",
                self.incremental_variant,
                kind.as_str()
            );

            if !self.should_run(&indexer_name, kind.min_interval()) {
                continue;
            }

            let key = watermark_key(&indexer_name, "");
            let watermark = *self.watermarks.entry(key.clone()).or_default();

            let Some((from, to)) = plan_range(watermark.last_block_num, latest, batch_cap_for(&file))
            else {
                continue;
            };

            let started = Instant::now();
            if let Err(err) = self.run_incremental_indexer(kind, &file, from, to).await {
                panic!(
                    "[chain {}] fatal: failed to run {indexer_name}: {err:#}",
                    self.chain_id
                );
            }

            log::info!(
                "[chain {}] {indexer_name} - processed blocks {from} to {to} ({} blocks, {} remaining) - {:?}",
                self.chain_id,
                to - from + 1,
                latest - to,
                started.elapsed()
            );

            let mut updated = watermark;
            updated.last_block_num = to;
            self.watermarks.insert(key, updated);
            self.last_run.insert(indexer_name.clone(), Instant::now());

            let caught_up = to >= latest;
            if caught_up || self.save_due(&indexer_name) {
                if let Err(err) =
                    save_watermark(&self.client, self.chain_id, &indexer_name, "", &updated).await
                {
                    panic!(
                        "[chain {}] fatal: failed to save watermark for {indexer_name}: {err:#}",
                        self.chain_id
                    );
                }
                self.last_save.insert(indexer_name, Instant::now());
            }
        }
    }

    async fn run_incremental_indexer(
        &self,
        kind: IncrementalKind,
        file: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<()> {
        let sql = load_sql(
            &self.sql_root,
            &format!("{}/{}/{file}.sql", self.incremental_variant, kind.as_str()),
        )?;

        // Text substitution for SELECT clauses, native binds for WHERE.
        let rendered = substitute(&sql, &[("{chain_id}", self.chain_id.to_string())]);

        self.client
            .query(&rendered)
            .param("chain_id", self.chain_id)
            .param("from_block", from_block)
            .param("to_block", to_block)
            .execute()
            .await?;
        Ok(())
    }

    fn should_run(&self, indexer_name: &str, min_interval: Duration) -> bool {
        match self.last_run.get(indexer_name) {
            Some(last) => last.elapsed() >= min_interval,
            None => true,
        }
    }

    fn save_due(&self, indexer_name: &str) -> bool {
        match self.last_save.get(indexer_name) {
            Some(last) => last.elapsed() >= WATERMARK_SAVE_INTERVAL,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_is_capped_at_the_batch_size() {
        assert_eq!(plan_range(0, 25_000, 20_000), Some((1, 20_000)));
    }

    #[test]
    fn second_run_finishes_the_backlog() {
        assert_eq!(plan_range(20_000, 25_000, 20_000), Some((20_001, 25_000)));
    }

    #[test]
    fn caught_up_plans_nothing() {
        assert_eq!(plan_range(25_000, 25_000, 20_000), None);
        assert_eq!(plan_range(30_000, 25_000, 20_000), None);
    }

    #[test]
    fn per_block_files_advance_one_block() {
        assert_eq!(batch_cap_for("native_balance_per_block"), 1);
        assert_eq!(batch_cap_for("address_on_chain"), INCREMENTAL_BATCH_SIZE);
        assert_eq!(plan_range(10, 500, batch_cap_for("native_balance_per_block")), Some((11, 11)));
    }
}
