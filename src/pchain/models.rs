//! Row types for the platform-transaction table and the parse step for
//! JSON-encoded P-chain blocks.
//!
//! Deep decoding of transaction payloads is deliberately out of scope: the
//! raw unsigned-tx JSON is persisted verbatim, and variants are named by a
//! pluggable classifier so downstream SQL can filter on `tx_type`.

use anyhow::{anyhow, Context, Result};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

/// The primary network is a subnet like any other, with a well-known ID.
pub const PRIMARY_NETWORK_SUBNET_ID: &str = "11111111111111111111111111111111LpoYY";

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct PlatformTxRow {
    pub chain_id: u32,
    pub block_number: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub block_time: OffsetDateTime,
    pub tx_id: String,
    pub tx_type: String,
    pub tx_data: String,
}

#[derive(Debug, Clone)]
pub struct PlatformBlock {
    pub height: u64,
    pub time: OffsetDateTime,
    pub txs: Vec<PlatformTxRow>,
}

/// Names the transaction variant from its unsigned-tx JSON. Implementations
/// are plug-ins; the engine never interprets the payload itself.
pub trait PlatformTxParser: Send + Sync {
    fn classify(&self, unsigned: &Value) -> String;
}

/// Default classifier: ordered rules matching on the keys each variant is
/// the only one to carry. First rule whose keys are all present wins, so
/// more specific key sets must come first.
pub struct KeyHeuristicParser;

const CLASSIFY_RULES: &[(&str, &[&str])] = &[
    ("ConvertSubnetToL1", &["subnetID", "address", "validators"]),
    ("RegisterL1Validator", &["balance", "message"]),
    ("IncreaseL1ValidatorBalance", &["validationID", "balance"]),
    ("SetL1ValidatorWeight", &["message"]),
    ("DisableL1Validator", &["validationID"]),
    ("CreateChain", &["chainName"]),
    ("TransformSubnet", &["initialSupply"]),
    ("AddSubnetValidator", &["validator", "subnetAuthorization"]),
    (
        "RemoveSubnetValidator",
        &["nodeID", "subnetID", "subnetAuthorization"],
    ),
    (
        "TransferSubnetOwnership",
        &["subnetID", "owner", "subnetAuthorization"],
    ),
    ("AddPermissionlessValidator", &["validator", "signer"]),
    (
        "AddPermissionlessDelegator",
        &["validator", "stake", "subnetID"],
    ),
    ("AddValidator", &["validator", "shares"]),
    ("AddDelegator", &["validator", "rewardsOwner"]),
    ("TransferSubnetOwnership", &["subnetID", "owner"]),
    ("CreateSubnet", &["owner"]),
    ("Import", &["sourceChain"]),
    ("Export", &["destinationChain"]),
    ("RewardValidator", &["txID"]),
    ("AdvanceTime", &["time"]),
];

impl PlatformTxParser for KeyHeuristicParser {
    fn classify(&self, unsigned: &Value) -> String {
        let Some(object) = unsigned.as_object() else {
            return "Unknown".to_string();
        };

        for (name, keys) in CLASSIFY_RULES {
            if keys.iter().all(|key| object.contains_key(*key)) {
                return name.to_string();
            }
        }
        "Unknown".to_string()
    }
}

/// Pre-Banff blocks carry no timestamp of their own; the original estimates
/// them from the mainnet launch date at ~2 s per block and so do we.
const MAINNET_LAUNCH: OffsetDateTime = datetime!(2020-09-21 00:00:00 UTC);

fn estimate_block_time(height: u64) -> OffsetDateTime {
    MAINNET_LAUNCH + Duration::seconds(2 * height as i64)
}

/// Parses the cached `platform.getBlockByHeight` (encoding json) result into
/// tx rows. Handles both standard blocks (`txs` array) and proposal blocks
/// (single `tx`).
pub fn parse_platform_block(
    chain_id: u32,
    height: u64,
    bytes: &[u8],
    parser: &dyn PlatformTxParser,
) -> Result<PlatformBlock> {
    let result: Value = serde_json::from_slice(bytes).context("failed to parse cached block")?;
    let block = result
        .get("block")
        .ok_or_else(|| anyhow!("response has no block field"))?;

    let parsed_height = block
        .get("height")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("block has no height"))?;
    if parsed_height != height {
        anyhow::bail!("block height mismatch: expected {height}, got {parsed_height}");
    }

    let time = match block.get("time").and_then(Value::as_i64) {
        Some(unix) => OffsetDateTime::from_unix_timestamp(unix)
            .map_err(|e| anyhow!("block time out of range: {e}"))?,
        None => estimate_block_time(height),
    };

    let tx_values: Vec<&Value> = match block.get("txs") {
        Some(Value::Array(txs)) => txs.iter().collect(),
        _ => block.get("tx").into_iter().collect(),
    };

    let mut txs = Vec::with_capacity(tx_values.len());
    for tx in tx_values {
        let tx_id = tx
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("transaction in block {height} has no id"))?
            .to_string();

        let unsigned = tx
            .get("unsignedTx")
            .ok_or_else(|| anyhow!("transaction {tx_id} has no unsignedTx"))?;

        txs.push(PlatformTxRow {
            chain_id,
            block_number: height,
            block_time: time,
            tx_id,
            tx_type: parser.classify(unsigned),
            tx_data: unsigned.to_string(),
        });
    }

    Ok(PlatformBlock { height, time, txs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(unsigned: Value) -> String {
        KeyHeuristicParser.classify(&unsigned)
    }

    #[test]
    fn classifies_by_distinguishing_keys() {
        assert_eq!(
            classify(json!({"owner": {"addresses": []}, "inputs": []})),
            "CreateSubnet"
        );
        assert_eq!(
            classify(json!({"subnetID": "abc", "chainName": "x", "vmID": "y"})),
            "CreateChain"
        );
        assert_eq!(
            classify(json!({"subnetID": "abc", "address": "0x", "validators": []})),
            "ConvertSubnetToL1"
        );
        assert_eq!(
            classify(json!({"validationID": "v", "balance": 5})),
            "IncreaseL1ValidatorBalance"
        );
        assert_eq!(classify(json!({"validationID": "v"})), "DisableL1Validator");
        assert_eq!(classify(json!({"time": 1600000000})), "AdvanceTime");
        assert_eq!(classify(json!({"something": 1})), "Unknown");
    }

    #[test]
    fn ownership_transfer_wins_over_subnet_creation() {
        // Both carry "owner"; the one that also names a subnet must match
        // the more specific rule first.
        assert_eq!(
            classify(json!({"subnetID": "abc", "owner": {}, "subnetAuthorization": []})),
            "TransferSubnetOwnership"
        );
        assert_eq!(classify(json!({"owner": {}})), "CreateSubnet");
    }

    #[test]
    fn parses_standard_block() {
        let bytes = serde_json::to_vec(&json!({
            "block": {
                "height": 42,
                "time": 1700000000,
                "parentID": "abc",
                "txs": [
                    {"id": "tx1", "unsignedTx": {"owner": {}}},
                    {"id": "tx2", "unsignedTx": {"sourceChain": "X"}}
                ]
            },
            "encoding": "json"
        }))
        .unwrap();

        let block = parse_platform_block(0, 42, &bytes, &KeyHeuristicParser).unwrap();
        assert_eq!(block.height, 42);
        assert_eq!(block.txs.len(), 2);
        assert_eq!(block.txs[0].tx_type, "CreateSubnet");
        assert_eq!(block.txs[1].tx_type, "Import");
        assert_eq!(block.time.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn parses_proposal_block_with_single_tx() {
        let bytes = serde_json::to_vec(&json!({
            "block": {
                "height": 7,
                "time": 1700000000,
                "tx": {"id": "tx9", "unsignedTx": {"txID": "rewarded"}}
            }
        }))
        .unwrap();

        let block = parse_platform_block(0, 7, &bytes, &KeyHeuristicParser).unwrap();
        assert_eq!(block.txs.len(), 1);
        assert_eq!(block.txs[0].tx_type, "RewardValidator");
    }

    #[test]
    fn estimates_time_for_blocks_without_one() {
        let bytes = serde_json::to_vec(&json!({
            "block": {"height": 100, "txs": []}
        }))
        .unwrap();

        let block = parse_platform_block(0, 100, &bytes, &KeyHeuristicParser).unwrap();
        assert_eq!(block.time, MAINNET_LAUNCH + Duration::seconds(200));
    }

    #[test]
    fn rejects_height_mismatch() {
        let bytes = serde_json::to_vec(&json!({"block": {"height": 5, "txs": []}})).unwrap();
        let err = parse_platform_block(0, 6, &bytes, &KeyHeuristicParser).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
