//! `ingest` - the continuous sync process: one syncer task per configured
//! chain, plus an index runner per chain unless --fast.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::info;

use crate::cache::BlockCache;
use crate::ch;
use crate::cmd::{CACHE_ROOT, SQL_ROOT};
use crate::config::{load_config, Vm};
use crate::evm::syncer::ChainSyncer;
use crate::indexer::IndexRunner;
use crate::pchain::syncer::PchainSyncer;
use crate::pchain::validators::ValidatorSyncer;
use crate::shutdown::Shutdown;

pub async fn run_ingest(config_path: &str, fast: bool, shutdown: Arc<Shutdown>) -> Result<()> {
    info!("Starting ingest...");

    let configs = load_config(config_path)?;
    let client = ch::connect().await?;
    ch::schema::create_tables(&client).await?;

    let mut handles = Vec::new();

    for cfg in configs {
        let cache = Arc::new(BlockCache::new(CACHE_ROOT, cfg.chain_id)?);

        match cfg.vm {
            Vm::Evm => {
                let (syncer, block_rx) =
                    ChainSyncer::new(cfg.clone(), client.clone(), cache, shutdown.clone())?;

                if !fast {
                    let runner =
                        IndexRunner::new(cfg.chain_id, client.clone(), SQL_ROOT, cfg.vm).await?;
                    handles.push(tokio::spawn(runner.run(block_rx, shutdown.clone())));
                }

                handles.push(tokio::spawn(syncer.run()));
            }
            Vm::Pchain => {
                let (syncer, block_rx) =
                    PchainSyncer::new(cfg.clone(), client.clone(), cache, shutdown.clone())?;

                if !fast {
                    let runner =
                        IndexRunner::new(cfg.chain_id, client.clone(), SQL_ROOT, cfg.vm).await?;
                    handles.push(tokio::spawn(runner.run(block_rx, shutdown.clone())));

                    if cfg.enable_validator_sync {
                        let validator_syncer = ValidatorSyncer::new(
                            cfg.chain_id,
                            client.clone(),
                            syncer.fetcher(),
                            cfg.validator_sync_interval(),
                            shutdown.clone(),
                        );
                        handles.push(tokio::spawn(validator_syncer.run()));
                    }
                }

                handles.push(tokio::spawn(syncer.run()));
            }
        }

        info!("Started syncer for chain {} ({})", cfg.chain_id, cfg.name);
    }

    // A panicked chain task (data-integrity violation, derivation failure)
    // takes the process down instead of silently degrading.
    futures::future::try_join_all(handles)
        .await
        .map_err(|err| anyhow!("chain task failed: {err}"))?;

    Ok(())
}
