//! Reset-value randomization.
//!
//! Park–Miller minimal standard generator, using Carta's division-free
//! reduction so it is cheap enough for the overflow path.

/// Default seed for a freshly configured register
pub const DEFAULT_SEED: u32 = 0x5EED_1234 & 0x7FFF_FFFF;

/// Advance a Park–Miller seed
#[inline]
pub fn carta_random32(seed: u32) -> u32 {
    let seed = if seed == 0 || seed >= 0x7FFF_FFFF { 1 } else { seed };
    let hi = 16_807u64 * (seed >> 16) as u64;
    let mut lo = 16_807u64 * (seed & 0xFFFF) as u64;
    lo += (hi & 0x7FFF) << 16;
    if lo > 0x7FFF_FFFF {
        lo &= 0x7FFF_FFFF;
        lo += 1;
    }
    lo += hi >> 15;
    if lo > 0x7FFF_FFFF {
        lo &= 0x7FFF_FFFF;
        lo += 1;
    }
    lo as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_minimal_standard() {
        // 16807^n mod (2^31 - 1) starting from 1
        let mut s = 1;
        s = carta_random32(s);
        assert_eq!(s, 16_807);
        s = carta_random32(s);
        assert_eq!(s, 282_475_249);
        s = carta_random32(s);
        assert_eq!(s, 1_622_650_073);
    }

    #[test]
    fn test_never_zero() {
        let mut s = DEFAULT_SEED;
        for _ in 0..10_000 {
            s = carta_random32(s);
            assert!(s != 0 && s < 0x7FFF_FFFF);
        }
    }
}
