pub mod consensus;
pub mod hashimoto;
