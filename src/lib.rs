#![deny(clippy::shadow_unrelated)]

pub mod api;
pub mod application;
pub mod error;
pub mod protocol;
pub mod state;

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use application::config::cli_args;
use application::config::cli_args::Command;
use application::config::data_directory::DataDirectory;
use tracing::info;

pub use crate::api::engine::PowEngine;
pub use crate::api::remote::RemoteMiningApi;
pub use crate::application::config::pow_config::PowConfig;
pub use crate::application::config::pow_mode::PowMode;
pub use crate::application::loops::channel::RemoteWorkItem;
pub use crate::application::loops::seal_loop::SealState;
pub use crate::error::PowError;
pub use crate::protocol::consensus::hash::BlockNonce;
pub use crate::protocol::consensus::hash::Hash256;
pub use crate::protocol::consensus::header::Header;
pub use crate::protocol::consensus::header::Solution;
pub use crate::protocol::hashimoto::EPOCH_LENGTH;
pub use crate::state::epoch_store::EpochStore;

/// Run the command given on the command line.
pub async fn initialize(args: cli_args::Args) -> Result<()> {
    let config = args.pow_config()?;

    match args.command {
        Command::MakeCache { block, dir } => {
            DataDirectory::create_dir_if_not_exists(&dir)?;
            let mode = config.pow_mode;
            let path = tokio::task::spawn_blocking(move || {
                state::epoch_store::make_cache(mode, block / EPOCH_LENGTH, &dir)
            })
            .await??;
            println!("{}", path.display());
        }
        Command::MakeDag { block, dir } => {
            DataDirectory::create_dir_if_not_exists(&dir)?;
            let mode = config.pow_mode;
            let path = tokio::task::spawn_blocking(move || {
                state::epoch_store::make_dataset(mode, block / EPOCH_LENGTH, &dir)
            })
            .await??;
            println!("{}", path.display());
        }
        Command::Mine { number, difficulty } => {
            if config.local_threads().is_none() && !config.pow_mode.skips_hashing() {
                anyhow::bail!("Local sealing is disabled; pass --threads with a positive count");
            }
            let engine = PowEngine::new(config);
            let mut header = Header::new(number, difficulty);
            header.timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            info!("Sealing block {number} at difficulty {difficulty}");
            let sealed = engine
                .seal(header)
                .await?
                .await
                .context("Sealing ended without a result")?;
            let engine_for_check = engine.clone();
            let checked = sealed.clone();
            tokio::task::spawn_blocking(move || engine_for_check.verify_seal(&checked, true))
                .await??;

            println!("nonce:      {}", sealed.nonce);
            println!("mix digest: {}", sealed.mix_digest);
            println!("seal hash:  {}", sealed.seal_hash());
            engine.close().await?;
        }
    }
    Ok(())
}
