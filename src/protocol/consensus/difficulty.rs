use num_bigint::BigUint;
use num_traits::One;
use num_traits::Zero;

use super::hash::Hash256;
use super::header::Header;
use crate::error::PowError;

/// 2^256, the numerator of every target.
fn two_pow_256() -> BigUint {
    BigUint::one() << 256u32
}

/// Convert the header's difficulty to a target threshold so as to test the
/// header's proof-of-work. A result hash passes if it is strictly below.
pub fn target_for(header: &Header) -> Result<BigUint, PowError> {
    if header.difficulty.is_zero() {
        return Err(PowError::InvalidDifficulty);
    }
    Ok(two_pow_256() / &header.difficulty)
}

/// Interpret a digest as a big-endian integer and compare against `target`.
pub fn meets_target(result: &Hash256, target: &BigUint) -> bool {
    BigUint::from_bytes_be(result.as_bytes()) < *target
}

/// Render a target as a 32-byte big-endian digest, the way it is handed to
/// remote miners. A target of 2^256 (difficulty one) saturates to all ones.
pub fn target_to_hash(target: &BigUint) -> Hash256 {
    let bytes = target.to_bytes_be();
    if bytes.len() > Hash256::LEN {
        return Hash256([0xff; 32]);
    }
    let mut out = [0u8; 32];
    out[Hash256::LEN - bytes.len()..].copy_from_slice(&bytes);
    Hash256(out)
}
