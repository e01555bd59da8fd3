use super::HASH_BYTES;
use super::MIX_BYTES;

const CACHE_BYTES_INIT: u64 = 1 << 24;
const CACHE_BYTES_GROWTH: u64 = 1 << 17;
const DATASET_BYTES_INIT: u64 = 1 << 30;
const DATASET_BYTES_GROWTH: u64 = 1 << 23;

/// Cache size used by the test mode, in bytes.
pub const TEST_CACHE_SIZE: usize = 1024;

/// Dataset size used by the test mode, in bytes.
pub const TEST_DATASET_SIZE: usize = 32 * 1024;

/// Size of the verification cache for `epoch`: grows linearly, trimmed down
/// until the row count is prime to avoid regular access patterns.
pub fn cache_size(epoch: u64) -> usize {
    let mut size = CACHE_BYTES_GROWTH
        .saturating_mul(epoch)
        .saturating_add(CACHE_BYTES_INIT - HASH_BYTES as u64);
    while !is_prime(size / HASH_BYTES as u64) {
        size -= 2 * HASH_BYTES as u64;
    }
    size as usize
}

/// Size of the mining dataset for `epoch`.
pub fn dataset_size(epoch: u64) -> usize {
    let mut size = DATASET_BYTES_GROWTH
        .saturating_mul(epoch)
        .saturating_add(DATASET_BYTES_INIT - MIX_BYTES as u64);
    while !is_prime(size / MIX_BYTES as u64) {
        size -= 2 * MIX_BYTES as u64;
    }
    size as usize
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primes() {
        let primes: Vec<u64> = (0..30).filter(|n| is_prime(*n)).collect();
        assert_eq!(vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29], primes);
    }

    #[test]
    fn sizes_are_row_aligned_and_grow() {
        for epoch in [0, 1, 2, 100] {
            let cache = cache_size(epoch);
            let dataset = dataset_size(epoch);
            assert_eq!(0, cache % HASH_BYTES);
            assert_eq!(0, dataset % MIX_BYTES);
            assert!(is_prime((cache / HASH_BYTES) as u64));
            assert!(is_prime((dataset / MIX_BYTES) as u64));
        }
        assert!(cache_size(1) > cache_size(0));
        assert!(dataset_size(1) > dataset_size(0));
    }

    #[test]
    fn first_epoch_matches_known_sizes() {
        assert_eq!(16_776_896, cache_size(0));
        assert_eq!(1_073_739_904, dataset_size(0));
    }
}
