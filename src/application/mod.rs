pub mod config;
pub mod loops;
