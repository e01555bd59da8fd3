pub mod epoch_store;
pub mod hashrate;
