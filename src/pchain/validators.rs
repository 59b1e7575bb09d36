//! Periodic discovery of subnets, chains and validators from the raw
//! platform transactions plus RPC snapshots, and the derived balance,
//! refund and fee-stat projections.
//!
//! Every write goes to a replace-by-key table, so a crashed cycle is
//! repaired by simply running the next one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clickhouse::{Client, Row};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::pchain::models::PRIMARY_NETWORK_SUBNET_ID;
use crate::pchain::rpc::{parse_utxo_hex, PchainFetcher, ValidatorInfo};
use crate::shutdown::Shutdown;

/// Continuous L1 validator fee, nano-units per second. The real fee is
/// dynamic; this flat rate is a documented approximation.
pub const L1_VALIDATOR_FEE_PER_SECOND: u64 = 512;

const WATERMARK_NAME: &str = "pchain/validator_sync";

const DISCOVERY_TX_TYPES: &str = "'CreateSubnet', 'CreateChain', 'ConvertSubnetToL1', \
     'TransformSubnet', 'RegisterL1Validator', 'AddValidator', \
     'AddPermissionlessValidator', 'AddSubnetValidator', 'IncreaseL1ValidatorBalance'";

/// Refund owed when a validator is disabled: deposits minus the continuous
/// fee accrued while active, never negative.
pub fn refund_amount(total_deposits: u64, active_seconds: u64) -> u64 {
    total_deposits.saturating_sub(active_seconds.saturating_mul(L1_VALIDATOR_FEE_PER_SECOND))
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct SubnetRow {
    chain_id: u32,
    subnet_id: String,
    subnet_type: String,
    owner: String,
    created_at_block: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    created_at_time: OffsetDateTime,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct SubnetChainRow {
    chain_id: u32,
    subnet_id: String,
    tx_id: String,
    chain_name: String,
    vm_id: String,
    created_at_block: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    created_at_time: OffsetDateTime,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ValidatorStateRow {
    pub chain_id: u32,
    pub subnet_id: String,
    pub validation_id: String,
    pub node_id: String,
    pub weight: u64,
    pub balance: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub start_time: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub end_time: OffsetDateTime,
    pub uptime: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct ValidatorHistoryRow {
    chain_id: u32,
    validation_id: String,
    subnet_id: String,
    node_id: String,
    tx_id: String,
    tx_type: String,
    weight: u64,
    registered_at_block: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    registered_at_time: OffsetDateTime,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct BalanceTxRow {
    chain_id: u32,
    validation_id: String,
    tx_id: String,
    kind: String,
    amount: u64,
    block_number: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    block_time: OffsetDateTime,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct RefundRow {
    chain_id: u32,
    validation_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    disabled_at: OffsetDateTime,
    active_seconds: u64,
    total_deposits: u64,
    amount: u64,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
struct FeeStatsRow {
    chain_id: u32,
    subnet_id: String,
    validator_count: u32,
    active_count: u32,
    total_balance: u64,
    total_weight: u64,
    fee_per_second: u64,
}

#[derive(Debug, Row, Deserialize)]
struct ScanTxRow {
    tx_id: String,
    tx_type: String,
    block_number: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    block_time: OffsetDateTime,
    tx_data: String,
}

#[derive(Debug, Row, Deserialize)]
struct SubnetIdRow {
    subnet_id: String,
}

#[derive(Debug, Row, Deserialize)]
struct BlockNumRow {
    last_block_num: u64,
}

pub struct ValidatorSyncer {
    chain_id: u32,
    client: Client,
    fetcher: Arc<PchainFetcher>,
    interval: Duration,
    shutdown: Arc<Shutdown>,
}

impl ValidatorSyncer {
    pub fn new(
        chain_id: u32,
        client: Client,
        fetcher: Arc<PchainFetcher>,
        interval: Duration,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            chain_id,
            client,
            fetcher,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(
            "[chain {}] starting validator syncer (interval {:?})",
            self.chain_id, self.interval
        );

        // Initial sync immediately, then on the interval.
        if let Err(err) = self.sync_once().await {
            error!("[chain {}] validator sync failed: {err:#}", self.chain_id);
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown.wait() => {
                    info!("[chain {}] stopping validator syncer", self.chain_id);
                    return;
                }
            }

            if let Err(err) = self.sync_once().await {
                error!("[chain {}] validator sync failed: {err:#}", self.chain_id);
            }
        }
    }

    async fn sync_once(&self) -> Result<()> {
        let started = Instant::now();

        self.ensure_genesis_subnets().await?;
        self.scan_platform_txs().await?;

        let states = self.snapshot_validators().await?;
        self.mark_absent_inactive(&states).await?;
        self.recompute_fee_stats(&states).await?;

        info!(
            "[chain {}] validator sync cycle completed: {} validators in {:?}",
            self.chain_id,
            states.len(),
            started.elapsed()
        );
        Ok(())
    }

    /// The primary network exists from genesis; everything else is
    /// discovered from transactions.
    async fn ensure_genesis_subnets(&self) -> Result<()> {
        let row = SubnetRow {
            chain_id: self.chain_id,
            subnet_id: PRIMARY_NETWORK_SUBNET_ID.to_string(),
            subnet_type: "primary".to_string(),
            owner: String::new(),
            created_at_block: 0,
            created_at_time: OffsetDateTime::UNIX_EPOCH,
        };
        crate::ch::insert_rows(&self.client, "subnets", &[row]).await
    }

    /// Scans platform transactions above the last processed block and
    /// projects subnets, chains, registrations and balance movements.
    async fn scan_platform_txs(&self) -> Result<()> {
        let from = self.last_processed_block().await?;
        let head = self
            .client
            .query("SELECT max(block_number) FROM platform_txs WHERE chain_id = ?")
            .bind(self.chain_id)
            .fetch_one::<u64>()
            .await
            .context("failed to read platform_txs head")?;

        if head <= from {
            return Ok(());
        }

        let sql = format!(
            "SELECT tx_id, tx_type, block_number, block_time, tx_data
             FROM platform_txs
             WHERE chain_id = ? AND block_number > ? AND block_number <= ?
               AND tx_type IN ({DISCOVERY_TX_TYPES})
             ORDER BY block_number"
        );
        let txs = self
            .client
            .query(&sql)
            .bind(self.chain_id)
            .bind(from)
            .bind(head)
            .fetch_all::<ScanTxRow>()
            .await
            .context("failed to scan platform txs")?;

        let mut subnets = Vec::new();
        let mut chains = Vec::new();
        let mut history = Vec::new();
        let mut balance_txs = Vec::new();

        for tx in &txs {
            let unsigned: Value = match serde_json::from_str(&tx.tx_data) {
                Ok(value) => value,
                Err(err) => {
                    warn!(
                        "[chain {}] unparsable tx_data for {}: {err}",
                        self.chain_id, tx.tx_id
                    );
                    continue;
                }
            };

            match tx.tx_type.as_str() {
                // The subnet's ID is the ID of the transaction that created it.
                "CreateSubnet" => subnets.push(SubnetRow {
                    chain_id: self.chain_id,
                    subnet_id: tx.tx_id.clone(),
                    subnet_type: "subnet".to_string(),
                    owner: json_field(&unsigned, "owner"),
                    created_at_block: tx.block_number,
                    created_at_time: tx.block_time,
                }),
                "TransformSubnet" => subnets.push(SubnetRow {
                    chain_id: self.chain_id,
                    subnet_id: json_str(&unsigned, "subnetID"),
                    subnet_type: "elastic".to_string(),
                    owner: String::new(),
                    created_at_block: tx.block_number,
                    created_at_time: tx.block_time,
                }),
                "ConvertSubnetToL1" => {
                    let subnet_id = json_str(&unsigned, "subnetID");
                    subnets.push(SubnetRow {
                        chain_id: self.chain_id,
                        subnet_id: subnet_id.clone(),
                        subnet_type: "l1".to_string(),
                        owner: String::new(),
                        created_at_block: tx.block_number,
                        created_at_time: tx.block_time,
                    });

                    // Conversion validators get their real validation IDs
                    // from the snapshot; until then they are addressed by
                    // their position in the conversion.
                    if let Some(validators) = unsigned.get("validators").and_then(Value::as_array) {
                        for (i, v) in validators.iter().enumerate() {
                            let validation_id = format!("{}/{i}", tx.tx_id);
                            history.push(ValidatorHistoryRow {
                                chain_id: self.chain_id,
                                validation_id: validation_id.clone(),
                                subnet_id: subnet_id.clone(),
                                node_id: json_str(v, "nodeID"),
                                tx_id: tx.tx_id.clone(),
                                tx_type: tx.tx_type.clone(),
                                weight: json_u64(v, "weight"),
                                registered_at_block: tx.block_number,
                                registered_at_time: tx.block_time,
                            });
                            balance_txs.push(BalanceTxRow {
                                chain_id: self.chain_id,
                                validation_id,
                                tx_id: tx.tx_id.clone(),
                                kind: "initial".to_string(),
                                amount: json_u64(v, "balance"),
                                block_number: tx.block_number,
                                block_time: tx.block_time,
                            });
                        }
                    }
                }
                "CreateChain" => chains.push(SubnetChainRow {
                    chain_id: self.chain_id,
                    subnet_id: json_str(&unsigned, "subnetID"),
                    tx_id: tx.tx_id.clone(),
                    chain_name: json_str(&unsigned, "chainName"),
                    vm_id: json_str(&unsigned, "vmID"),
                    created_at_block: tx.block_number,
                    created_at_time: tx.block_time,
                }),
                "RegisterL1Validator" => {
                    history.push(ValidatorHistoryRow {
                        chain_id: self.chain_id,
                        validation_id: tx.tx_id.clone(),
                        subnet_id: String::new(),
                        node_id: String::new(),
                        tx_id: tx.tx_id.clone(),
                        tx_type: tx.tx_type.clone(),
                        weight: 0,
                        registered_at_block: tx.block_number,
                        registered_at_time: tx.block_time,
                    });
                    balance_txs.push(BalanceTxRow {
                        chain_id: self.chain_id,
                        validation_id: tx.tx_id.clone(),
                        tx_id: tx.tx_id.clone(),
                        kind: "initial".to_string(),
                        amount: json_u64(&unsigned, "balance"),
                        block_number: tx.block_number,
                        block_time: tx.block_time,
                    });
                }
                "AddValidator" | "AddPermissionlessValidator" | "AddSubnetValidator" => {
                    let validator = unsigned.get("validator").cloned().unwrap_or(Value::Null);
                    let subnet_id = {
                        let s = json_str(&unsigned, "subnetID");
                        if s.is_empty() {
                            let nested = json_str(&validator, "subnetID");
                            if nested.is_empty() {
                                PRIMARY_NETWORK_SUBNET_ID.to_string()
                            } else {
                                nested
                            }
                        } else {
                            s
                        }
                    };
                    history.push(ValidatorHistoryRow {
                        chain_id: self.chain_id,
                        validation_id: tx.tx_id.clone(),
                        subnet_id,
                        node_id: json_str(&validator, "nodeID"),
                        tx_id: tx.tx_id.clone(),
                        tx_type: tx.tx_type.clone(),
                        weight: json_u64(&validator, "weight"),
                        registered_at_block: tx.block_number,
                        registered_at_time: tx.block_time,
                    });
                }
                "IncreaseL1ValidatorBalance" => balance_txs.push(BalanceTxRow {
                    chain_id: self.chain_id,
                    validation_id: json_str(&unsigned, "validationID"),
                    tx_id: tx.tx_id.clone(),
                    kind: "topup".to_string(),
                    amount: json_u64(&unsigned, "balance"),
                    block_number: tx.block_number,
                    block_time: tx.block_time,
                }),
                other => {
                    warn!("[chain {}] unhandled discovery tx type {other}", self.chain_id);
                }
            }
        }

        crate::ch::insert_rows(&self.client, "subnets", &subnets).await?;
        crate::ch::insert_rows(&self.client, "subnet_chains", &chains).await?;
        crate::ch::insert_rows(&self.client, "l1_validator_history", &history).await?;
        crate::ch::insert_rows(&self.client, "l1_validator_balance_txs", &balance_txs).await?;

        self.save_processed_block(head).await?;

        info!(
            "[chain {}] scanned blocks {from}..{head}: {} subnets, {} chains, {} registrations, {} balance txs",
            self.chain_id,
            subnets.len(),
            chains.len(),
            history.len(),
            balance_txs.len()
        );
        Ok(())
    }

    /// Snapshots the current validator set of the primary network and every
    /// discovered subnet. A failing subnet is skipped, not fatal.
    async fn snapshot_validators(&self) -> Result<Vec<ValidatorStateRow>> {
        let subnet_ids = self
            .client
            .query("SELECT DISTINCT subnet_id FROM subnets WHERE chain_id = ?")
            .bind(self.chain_id)
            .fetch_all::<SubnetIdRow>()
            .await
            .context("failed to list subnets")?;

        let mut all_states = Vec::new();
        for SubnetIdRow { subnet_id } in subnet_ids {
            let target = if subnet_id == PRIMARY_NETWORK_SUBNET_ID {
                None
            } else {
                Some(subnet_id.as_str())
            };

            let response = match self.fetcher.get_current_validators(target).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(
                        "[chain {}] failed to fetch validators for subnet {subnet_id}: {err:#}",
                        self.chain_id
                    );
                    continue;
                }
            };

            let states: Vec<ValidatorStateRow> = response
                .validators
                .iter()
                .map(|info| parse_validator_info(self.chain_id, &subnet_id, info))
                .collect();

            crate::ch::insert_rows(&self.client, "l1_validator_state", &states).await?;
            all_states.extend(states);
        }

        Ok(all_states)
    }

    /// Validators that were active but are absent from the snapshot have
    /// been disabled: toggle them off and project their refunds.
    async fn mark_absent_inactive(&self, snapshot: &[ValidatorStateRow]) -> Result<()> {
        let seen: HashSet<(&str, &str)> = snapshot
            .iter()
            .map(|s| (s.subnet_id.as_str(), s.validation_id.as_str()))
            .collect();

        let previous = self
            .client
            .query(
                "SELECT chain_id, subnet_id, validation_id, node_id, weight, balance,
                        start_time, end_time, uptime, active
                 FROM l1_validator_state FINAL
                 WHERE chain_id = ? AND active = true",
            )
            .bind(self.chain_id)
            .fetch_all::<ValidatorStateRow>()
            .await
            .context("failed to read previous validator state")?;

        let now = OffsetDateTime::now_utc();
        let mut disabled = Vec::new();
        let mut refunds = Vec::new();
        let mut refund_ledger = Vec::new();

        for mut row in previous {
            if seen.contains(&(row.subnet_id.as_str(), row.validation_id.as_str())) {
                continue;
            }

            let deposits = self.total_deposits(&row.validation_id).await?;
            let active_seconds = (now - row.start_time).whole_seconds().max(0) as u64;
            let amount = refund_amount(deposits, active_seconds);

            refunds.push(RefundRow {
                chain_id: self.chain_id,
                validation_id: row.validation_id.clone(),
                disabled_at: now,
                active_seconds,
                total_deposits: deposits,
                amount,
            });
            refund_ledger.push(BalanceTxRow {
                chain_id: self.chain_id,
                validation_id: row.validation_id.clone(),
                tx_id: format!("refund-{}", row.validation_id),
                kind: "refund".to_string(),
                amount,
                block_number: 0,
                block_time: now,
            });

            self.confirm_refund_utxo(&row.validation_id, amount).await;

            row.active = false;
            row.balance = 0;
            disabled.push(row);
        }

        if !disabled.is_empty() {
            info!(
                "[chain {}] marking {} validators inactive",
                self.chain_id,
                disabled.len()
            );
        }

        crate::ch::insert_rows(&self.client, "l1_validator_state", &disabled).await?;
        crate::ch::insert_rows(&self.client, "l1_validator_refunds", &refunds).await?;
        crate::ch::insert_rows(&self.client, "l1_validator_balance_txs", &refund_ledger).await
    }

    /// Best-effort: if the node still answers for this validation ID, look
    /// for the refund UTXO on the remaining-balance owner and compare it to
    /// the computed amount.
    async fn confirm_refund_utxo(&self, validation_id: &str, computed: u64) {
        let Ok(validator) = self.fetcher.get_l1_validator(validation_id).await else {
            return;
        };
        let addresses = validator.remaining_balance_owner.addresses;
        if addresses.is_empty() {
            return;
        }
        let Ok(response) = self.fetcher.get_utxos(&addresses).await else {
            return;
        };

        let observed = response
            .utxos
            .iter()
            .filter_map(|u| parse_utxo_hex(u).ok())
            .find(|u| u.amount == computed);

        match observed {
            Some(_) => info!(
                "[chain {}] refund UTXO for {validation_id} matches computed amount {computed}",
                self.chain_id
            ),
            None => warn!(
                "[chain {}] no refund UTXO matching computed amount {computed} for {validation_id}",
                self.chain_id
            ),
        }
    }

    async fn total_deposits(&self, validation_id: &str) -> Result<u64> {
        self.client
            .query(
                "SELECT sum(amount) FROM l1_validator_balance_txs
                 WHERE chain_id = ? AND validation_id = ? AND kind IN ('initial', 'topup')",
            )
            .bind(self.chain_id)
            .bind(validation_id)
            .fetch_one::<u64>()
            .await
            .context("failed to sum deposits")
    }

    /// Aggregate fee statistics per subnet from the fresh snapshot.
    async fn recompute_fee_stats(&self, snapshot: &[ValidatorStateRow]) -> Result<()> {
        let mut per_subnet: HashMap<&str, FeeStatsRow> = HashMap::new();

        for state in snapshot {
            let entry = per_subnet
                .entry(state.subnet_id.as_str())
                .or_insert_with(|| FeeStatsRow {
                    chain_id: self.chain_id,
                    subnet_id: state.subnet_id.clone(),
                    validator_count: 0,
                    active_count: 0,
                    total_balance: 0,
                    total_weight: 0,
                    fee_per_second: 0,
                });

            entry.validator_count += 1;
            if state.active {
                entry.active_count += 1;
            }
            entry.total_balance = entry.total_balance.saturating_add(state.balance);
            entry.total_weight = entry.total_weight.saturating_add(state.weight);
            entry.fee_per_second = entry.active_count as u64 * L1_VALIDATOR_FEE_PER_SECOND;
        }

        let rows: Vec<FeeStatsRow> = per_subnet.into_values().collect();
        crate::ch::insert_rows(&self.client, "l1_fee_stats", &rows).await
    }

    async fn last_processed_block(&self) -> Result<u64> {
        let row = self
            .client
            .query(
                "SELECT last_block_num FROM indexer_watermarks FINAL
                 WHERE chain_id = ? AND indexer_name = ?",
            )
            .bind(self.chain_id)
            .bind(WATERMARK_NAME)
            .fetch_optional::<BlockNumRow>()
            .await
            .context("failed to load validator sync watermark")?;

        Ok(row.map(|r| r.last_block_num).unwrap_or(0))
    }

    async fn save_processed_block(&self, block_num: u64) -> Result<()> {
        self.client
            .query(
                "INSERT INTO indexer_watermarks
                 (chain_id, indexer_name, granularity, last_period, last_block_num)
                 VALUES (?, ?, '', 0, ?)",
            )
            .bind(self.chain_id)
            .bind(WATERMARK_NAME)
            .bind(block_num)
            .execute()
            .await
            .context("failed to save validator sync watermark")
    }
}

/// Normalises a snapshot entry. IDs are carried opaquely, exactly as the
/// RPC returned them; numeric fields arrive as strings.
fn parse_validator_info(chain_id: u32, subnet_id: &str, info: &ValidatorInfo) -> ValidatorStateRow {
    let is_l1 = !info.validation_id.is_empty();
    let balance = parse_numeric(&info.balance);

    // Non-L1 validators have no validation ID; their registration tx
    // stands in for it.
    let validation_id = if is_l1 {
        info.validation_id.clone()
    } else {
        info.tx_id.clone()
    };

    // An L1 validator with no balance left cannot validate.
    let active = !(is_l1 && balance == 0);

    ValidatorStateRow {
        chain_id,
        subnet_id: subnet_id.to_string(),
        validation_id,
        node_id: info.node_id.clone(),
        weight: parse_numeric(&info.weight),
        balance,
        start_time: time_from_unix_str(&info.start_time),
        end_time: time_from_unix_str(&info.end_time),
        uptime: info.uptime.parse().unwrap_or(0.0),
        active,
    }
}

fn parse_numeric(value: &str) -> u64 {
    value.parse().unwrap_or(0)
}

fn time_from_unix_str(value: &str) -> OffsetDateTime {
    let unix: i64 = value.parse().unwrap_or(0);
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn json_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Reads a numeric JSON field that may be a number or a decimal string.
fn json_u64(value: &Value, key: &str) -> u64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Serialises an object field verbatim, empty string when absent.
fn json_field(value: &Value, key: &str) -> String {
    value.get(key).map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refund_is_deposits_minus_accrued_fee() {
        // 1000 seconds at 512/s against a 1M deposit.
        assert_eq!(refund_amount(1_000_000, 1_000), 1_000_000 - 512_000);
    }

    #[test]
    fn refund_clamps_at_zero() {
        assert_eq!(refund_amount(1_000, 1_000_000), 0);
        assert_eq!(refund_amount(0, 0), 0);
    }

    #[test]
    fn l1_validator_with_zero_balance_is_inactive() {
        let info = ValidatorInfo {
            validation_id: "val1".to_string(),
            balance: "0".to_string(),
            weight: "100".to_string(),
            ..Default::default()
        };
        let state = parse_validator_info(0, "subnet", &info);
        assert!(!state.active);
        assert_eq!(state.validation_id, "val1");
    }

    #[test]
    fn primary_validator_falls_back_to_tx_id() {
        let info = ValidatorInfo {
            tx_id: "tx42".to_string(),
            weight: "2000000000000".to_string(),
            start_time: "1700000000".to_string(),
            ..Default::default()
        };
        let state = parse_validator_info(0, PRIMARY_NETWORK_SUBNET_ID, &info);
        assert!(state.active);
        assert_eq!(state.validation_id, "tx42");
        assert_eq!(state.weight, 2_000_000_000_000);
        assert_eq!(state.start_time.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn json_helpers_accept_both_shapes() {
        let v = json!({"weight": 7, "balance": "12", "nodeID": "NodeID-x"});
        assert_eq!(json_u64(&v, "weight"), 7);
        assert_eq!(json_u64(&v, "balance"), 12);
        assert_eq!(json_u64(&v, "missing"), 0);
        assert_eq!(json_str(&v, "nodeID"), "NodeID-x");
        assert_eq!(json_field(&v, "weight"), "7");
    }
}
