pub mod difficulty;
pub mod hash;
pub mod header;
pub mod verifier;
