pub mod cli_args;
pub mod data_directory;
pub mod pow_config;
pub mod pow_mode;
