//! Row types for the EVM raw tables and the parse step that turns a cached
//! RPC envelope into them.
//!
//! Parsing is the only place the raw bytes are interpreted: the fetcher
//! caches the envelope exactly as returned by the RPC and hands the bytes
//! here.

use anyhow::{anyhow, bail, Context, Result};
use clickhouse::Row;
use ethers::types::{Block, Bytes, Transaction, TransactionReceipt, H160, H256, U256};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct RawBlockRow {
    pub chain_id: u32,
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub block_time: OffsetDateTime,
    pub miner: String,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee_per_gas: u64,
    pub difficulty: String,
    pub size: u64,
    pub extra_data: String,
    pub tx_count: u32,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct RawTxRow {
    pub chain_id: u32,
    pub block_number: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub block_time: OffsetDateTime,
    pub tx_hash: String,
    pub tx_index: u32,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub max_fee_per_gas: u64,
    pub max_priority_fee_per_gas: u64,
    pub base_fee_per_gas: u64,
    pub input: String,
    pub tx_type: u8,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: u64,
    pub cumulative_gas_used: u64,
    pub contract_address: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct RawTraceRow {
    pub chain_id: u32,
    pub block_number: u64,
    pub tx_hash: String,
    pub tx_index: u32,
    pub trace_address: String,
    pub call_type: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub gas: u64,
    pub gas_used: u64,
    pub input: String,
    pub output: String,
    pub error: String,
    pub tx_success: bool,
    pub tx_from: String,
    pub tx_to: String,
}

#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct RawLogRow {
    pub chain_id: u32,
    pub block_number: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub block_time: OffsetDateTime,
    pub tx_hash: String,
    pub tx_index: u32,
    pub log_index: u32,
    pub address: String,
    pub topic0: String,
    pub topic1: String,
    pub topic2: String,
    pub topic3: String,
    pub data: String,
    pub tx_success: bool,
    pub tx_from: String,
    pub tx_to: String,
}

/// Everything the raw sink appends for one block, in one logical step.
#[derive(Debug, Clone)]
pub struct EvmBlockBundle {
    pub number: u64,
    pub time: OffsetDateTime,
    pub block: RawBlockRow,
    pub txs: Vec<RawTxRow>,
    pub traces: Vec<RawTraceRow>,
    pub logs: Vec<RawLogRow>,
}

/// The cached unit: the three RPC responses for one block, verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcBlockEnvelope {
    pub block: serde_json::Value,
    pub receipts: serde_json::Value,
    pub traces: serde_json::Value,
}

/// One entry of a `debug_traceBlockByNumber` (callTracer) response.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceResultEntry {
    #[serde(default, rename = "txHash")]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub result: Option<CallFrame>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A callTracer frame. Hand-rolled because the response shape is stable and
/// we only persist a flat projection of it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(rename = "type", default)]
    pub call_type: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<CallFrame>,
}

pub fn format_hash(hash: H256) -> String {
    format!("{hash:?}")
}

pub fn format_address(address: H160) -> String {
    format!("{address:?}")
}

pub fn format_bytes(bytes: &Bytes) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parses a hex quantity ("0x1a") into u64, saturating on overflow.
pub fn parse_hex_u64(quantity: &str) -> u64 {
    let digits = quantity.trim_start_matches("0x");
    if digits.is_empty() {
        return 0;
    }
    u64::from_str_radix(digits, 16).unwrap_or(u64::MAX)
}

/// Parses a hex quantity into a decimal string, "0" when absent or invalid.
pub fn hex_to_decimal(quantity: &str) -> String {
    let digits = quantity.trim_start_matches("0x");
    if digits.is_empty() {
        return "0".to_string();
    }
    match U256::from_str_radix(digits, 16) {
        Ok(value) => value.to_string(),
        Err(_) => "0".to_string(),
    }
}

fn u256_to_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

fn block_time_from_timestamp(timestamp: U256) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(u256_to_u64(timestamp) as i64)
        .map_err(|e| anyhow!("block timestamp out of range: {e}"))
}

/// Parses a cached envelope into the four row families for one block,
/// applying the write-time denormalisations (`base_fee_per_gas` block to tx,
/// `tx_success` / `tx_from` / `tx_to` tx to traces and logs).
pub fn parse_bundle(chain_id: u32, height: u64, bytes: &[u8]) -> Result<EvmBlockBundle> {
    let envelope: RpcBlockEnvelope =
        serde_json::from_slice(bytes).context("failed to parse cached envelope")?;

    let block: Block<Transaction> =
        serde_json::from_value(envelope.block).context("failed to parse block")?;
    let receipts: Vec<TransactionReceipt> = if envelope.receipts.is_null() {
        Vec::new()
    } else {
        serde_json::from_value(envelope.receipts).context("failed to parse receipts")?
    };
    let traces: Vec<TraceResultEntry> = if envelope.traces.is_null() {
        Vec::new()
    } else {
        serde_json::from_value(envelope.traces).context("failed to parse traces")?
    };

    let number = block
        .number
        .ok_or_else(|| anyhow!("block has no number (pending?)"))?
        .as_u64();
    if number != height {
        bail!("block number mismatch: expected {height}, got {number}");
    }

    let block_time = block_time_from_timestamp(block.timestamp)?;
    let base_fee_per_gas = block.base_fee_per_gas.map(u256_to_u64).unwrap_or(0);

    let block_row = RawBlockRow {
        chain_id,
        block_number: number,
        block_hash: block.hash.map(format_hash).unwrap_or_default(),
        parent_hash: format_hash(block.parent_hash),
        block_time,
        miner: block.author.map(format_address).unwrap_or_default(),
        gas_limit: u256_to_u64(block.gas_limit),
        gas_used: u256_to_u64(block.gas_used),
        base_fee_per_gas,
        difficulty: block.difficulty.to_string(),
        size: block.size.map(u256_to_u64).unwrap_or(0),
        extra_data: format_bytes(&block.extra_data),
        tx_count: block.transactions.len() as u32,
    };

    if receipts.len() != block.transactions.len() {
        bail!(
            "receipt count {} does not match tx count {} in block {number}",
            receipts.len(),
            block.transactions.len()
        );
    }

    let mut txs = Vec::with_capacity(block.transactions.len());
    let mut trace_rows = Vec::new();
    let mut logs = Vec::new();

    for (i, tx) in block.transactions.iter().enumerate() {
        let receipt = &receipts[i];
        if receipt.transaction_hash != tx.hash {
            bail!(
                "receipt order mismatch in block {number}: tx {} vs receipt {}",
                format_hash(tx.hash),
                format_hash(receipt.transaction_hash)
            );
        }

        let tx_hash = format_hash(tx.hash);
        let tx_index = tx
            .transaction_index
            .map(|idx| idx.as_u64() as u32)
            .unwrap_or(i as u32);
        let from_address = format_address(tx.from);
        let to_address = tx.to.map(format_address).unwrap_or_default();

        // No status field means the tx predates EIP-658, which means it was
        // included as valid.
        let success = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(true);

        txs.push(RawTxRow {
            chain_id,
            block_number: number,
            block_time,
            tx_hash: tx_hash.clone(),
            tx_index,
            from_address: from_address.clone(),
            to_address: to_address.clone(),
            value: tx.value.to_string(),
            nonce: u256_to_u64(tx.nonce),
            gas_limit: u256_to_u64(tx.gas),
            gas_price: tx.gas_price.map(u256_to_u64).unwrap_or(0),
            max_fee_per_gas: tx.max_fee_per_gas.map(u256_to_u64).unwrap_or(0),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas.map(u256_to_u64).unwrap_or(0),
            base_fee_per_gas,
            input: format_bytes(&tx.input),
            tx_type: tx
                .transaction_type
                .map(|t| t.as_u64() as u8)
                .unwrap_or(0),
            success,
            gas_used: receipt.gas_used.map(u256_to_u64).unwrap_or(0),
            effective_gas_price: receipt.effective_gas_price.map(u256_to_u64).unwrap_or(0),
            cumulative_gas_used: u256_to_u64(receipt.cumulative_gas_used),
            contract_address: receipt
                .contract_address
                .map(format_address)
                .unwrap_or_default(),
        });

        for log in &receipt.logs {
            let topics: Vec<String> = log.topics.iter().map(|t| format_hash(*t)).collect();
            let topic = |n: usize| topics.get(n).cloned().unwrap_or_default();

            logs.push(RawLogRow {
                chain_id,
                block_number: number,
                block_time,
                tx_hash: tx_hash.clone(),
                tx_index,
                log_index: log
                    .log_index
                    .map(|idx| u256_to_u64(idx) as u32)
                    .unwrap_or(0),
                address: format_address(log.address),
                topic0: topic(0),
                topic1: topic(1),
                topic2: topic(2),
                topic3: topic(3),
                data: format_bytes(&log.data),
                tx_success: success,
                tx_from: from_address.clone(),
                tx_to: to_address.clone(),
            });
        }

        // Traces align positionally with the block's transactions; txHash is
        // cross-checked when the tracer provides it.
        if let Some(entry) = traces.get(i) {
            if let Some(trace_hash) = &entry.tx_hash {
                if *trace_hash != tx_hash {
                    bail!(
                        "trace order mismatch in block {number}: tx {tx_hash} vs trace {trace_hash}"
                    );
                }
            }
            if let Some(frame) = &entry.result {
                flatten_call_frames(
                    frame,
                    &mut trace_rows,
                    TraceContext {
                        chain_id,
                        block_number: number,
                        tx_hash: &tx_hash,
                        tx_index,
                        tx_success: success,
                        tx_from: &from_address,
                        tx_to: &to_address,
                    },
                );
            }
        }
    }

    Ok(EvmBlockBundle {
        number,
        time: block_time,
        block: block_row,
        txs,
        traces: trace_rows,
        logs,
    })
}

#[derive(Clone, Copy)]
struct TraceContext<'a> {
    chain_id: u32,
    block_number: u64,
    tx_hash: &'a str,
    tx_index: u32,
    tx_success: bool,
    tx_from: &'a str,
    tx_to: &'a str,
}

/// Flattens a call tree into rows. The root frame gets the empty path;
/// children are addressed "0", "0.1", and so on in call order.
fn flatten_call_frames(frame: &CallFrame, out: &mut Vec<RawTraceRow>, ctx: TraceContext) {
    fn walk(frame: &CallFrame, path: String, out: &mut Vec<RawTraceRow>, ctx: TraceContext) {
        out.push(RawTraceRow {
            chain_id: ctx.chain_id,
            block_number: ctx.block_number,
            tx_hash: ctx.tx_hash.to_string(),
            tx_index: ctx.tx_index,
            trace_address: path.clone(),
            call_type: frame.call_type.clone(),
            from_address: frame.from.clone(),
            to_address: frame.to.clone().unwrap_or_default(),
            value: hex_to_decimal(frame.value.as_deref().unwrap_or("")),
            gas: parse_hex_u64(frame.gas.as_deref().unwrap_or("")),
            gas_used: parse_hex_u64(frame.gas_used.as_deref().unwrap_or("")),
            input: frame.input.clone().unwrap_or_default(),
            output: frame.output.clone().unwrap_or_default(),
            error: frame.error.clone().unwrap_or_default(),
            tx_success: ctx.tx_success,
            tx_from: ctx.tx_from.to_string(),
            tx_to: ctx.tx_to.to_string(),
        });

        for (i, child) in frame.calls.iter().enumerate() {
            let child_path = if path.is_empty() {
                i.to_string()
            } else {
                format!("{path}.{i}")
            };
            walk(child, child_path, out, ctx);
        }
    }

    walk(frame, String::new(), out, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_hex_u64("0x1a"), 26);
        assert_eq!(parse_hex_u64("0x"), 0);
        assert_eq!(parse_hex_u64(""), 0);
        assert_eq!(hex_to_decimal("0xde0b6b3a7640000"), "1000000000000000000");
        assert_eq!(hex_to_decimal(""), "0");
    }

    fn frame(call_type: &str, calls: Vec<CallFrame>) -> CallFrame {
        CallFrame {
            call_type: call_type.to_string(),
            from: "0xaa".to_string(),
            to: Some("0xbb".to_string()),
            value: Some("0x0".to_string()),
            gas: Some("0x5208".to_string()),
            gas_used: Some("0x5208".to_string()),
            input: Some("0x".to_string()),
            output: None,
            error: None,
            calls,
        }
    }

    #[test]
    fn call_tree_flattens_to_dotted_paths() {
        let root = frame(
            "CALL",
            vec![
                frame("STATICCALL", vec![]),
                frame("DELEGATECALL", vec![frame("CALL", vec![])]),
            ],
        );

        let mut rows = Vec::new();
        flatten_call_frames(
            &root,
            &mut rows,
            TraceContext {
                chain_id: 1,
                block_number: 10,
                tx_hash: "0xdead",
                tx_index: 0,
                tx_success: true,
                tx_from: "0xaa",
                tx_to: "0xbb",
            },
        );

        let paths: Vec<&str> = rows.iter().map(|r| r.trace_address.as_str()).collect();
        assert_eq!(paths, vec!["", "0", "1", "1.0"]);
        assert!(rows.iter().all(|r| r.tx_success));
        assert_eq!(rows[0].gas, 0x5208);
    }

    fn sample_envelope() -> Vec<u8> {
        let zero32 = format!("0x{}", "00".repeat(32));
        let bloom = format!("0x{}", "00".repeat(256));
        let tx_hash = format!("0x{}", "11".repeat(32));

        let envelope = json!({
            "block": {
                "hash": format!("0x{}", "22".repeat(32)),
                "parentHash": &zero32,
                "sha3Uncles": &zero32,
                "miner": format!("0x{}", "33".repeat(20)),
                "stateRoot": &zero32,
                "transactionsRoot": &zero32,
                "receiptsRoot": &zero32,
                "number": "0x64",
                "gasUsed": "0x5208",
                "gasLimit": "0x1c9c380",
                "baseFeePerGas": "0x19",
                "extraData": "0x",
                "nonce": "0x0000000000000000",
                "mixHash": &zero32,
                "logsBloom": &bloom,
                "timestamp": "0x65a0f480",
                "difficulty": "0x0",
                "totalDifficulty": "0x0",
                "size": "0x220",
                "uncles": [],
                "transactions": [{
                    "hash": &tx_hash,
                    "nonce": "0x1",
                    "blockHash": format!("0x{}", "22".repeat(32)),
                    "blockNumber": "0x64",
                    "transactionIndex": "0x0",
                    "from": format!("0x{}", "44".repeat(20)),
                    "to": format!("0x{}", "55".repeat(20)),
                    "value": "0xde0b6b3a7640000",
                    "gas": "0x5208",
                    "gasPrice": "0x19",
                    "input": "0x",
                    "v": "0x1",
                    "r": "0x1",
                    "s": "0x1"
                }]
            },
            "receipts": [{
                "transactionHash": &tx_hash,
                "transactionIndex": "0x0",
                "blockHash": format!("0x{}", "22".repeat(32)),
                "blockNumber": "0x64",
                "from": format!("0x{}", "44".repeat(20)),
                "to": format!("0x{}", "55".repeat(20)),
                "cumulativeGasUsed": "0x5208",
                "gasUsed": "0x5208",
                "effectiveGasPrice": "0x19",
                "contractAddress": null,
                "status": "0x1",
                "logsBloom": &bloom,
                "logs": [{
                    "address": format!("0x{}", "66".repeat(20)),
                    "topics": [format!("0x{}", "77".repeat(32))],
                    "data": "0xff",
                    "blockNumber": "0x64",
                    "transactionHash": &tx_hash,
                    "transactionIndex": "0x0",
                    "blockHash": format!("0x{}", "22".repeat(32)),
                    "logIndex": "0x0",
                    "removed": false
                }]
            }],
            "traces": [{
                "txHash": &tx_hash,
                "result": {
                    "type": "CALL",
                    "from": format!("0x{}", "44".repeat(20)),
                    "to": format!("0x{}", "55".repeat(20)),
                    "value": "0xde0b6b3a7640000",
                    "gas": "0x5208",
                    "gasUsed": "0x5208",
                    "input": "0x",
                    "calls": [{
                        "type": "STATICCALL",
                        "from": format!("0x{}", "55".repeat(20)),
                        "to": format!("0x{}", "66".repeat(20)),
                        "gas": "0x100",
                        "gasUsed": "0x80",
                        "input": "0x"
                    }]
                }
            }]
        });

        serde_json::to_vec(&envelope).unwrap()
    }

    #[test]
    fn parse_bundle_builds_all_row_families() {
        let bundle = parse_bundle(43114, 100, &sample_envelope()).unwrap();

        assert_eq!(bundle.number, 100);
        assert_eq!(bundle.block.tx_count, 1);
        assert_eq!(bundle.block.base_fee_per_gas, 25);

        assert_eq!(bundle.txs.len(), 1);
        let tx = &bundle.txs[0];
        assert!(tx.success);
        assert_eq!(tx.value, "1000000000000000000");
        // Denormalised from the block at write time.
        assert_eq!(tx.base_fee_per_gas, 25);

        assert_eq!(bundle.logs.len(), 1);
        let log = &bundle.logs[0];
        assert_eq!(log.topic0, format!("0x{}", "77".repeat(32)));
        assert_eq!(log.topic1, "");
        assert_eq!(log.tx_from, tx.from_address);
        assert!(log.tx_success);

        assert_eq!(bundle.traces.len(), 2);
        assert_eq!(bundle.traces[0].trace_address, "");
        assert_eq!(bundle.traces[1].trace_address, "0");
        assert_eq!(bundle.traces[0].tx_to, tx.to_address);
    }

    #[test]
    fn parse_bundle_rejects_height_mismatch() {
        let err = parse_bundle(43114, 101, &sample_envelope()).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
