//! Count trailing zeros
//!
//! The priority bitmap's scan is a single CTZ on most targets. Armv6-M and a
//! few other small cores have no usable CTZ/CLZ encoding, so a branchless
//! multiply-and-shift fallback is provided for them.

#[allow(clippy::needless_bool)]
const HAS_CTZ: bool = if cfg!(target_arch = "arm") {
    // Thumb-2 (CLZ + RBIT); Armv6-M has neither
    cfg!(target_feature = "v6t2")
} else if cfg!(target_arch = "msp430") || cfg!(target_arch = "avr") {
    false
} else {
    // AArch64, RISC-V (via software sequence in LLVM), x86: fine as-is
    true
};

/// De Bruijn sequence for a 32-bit multiply-and-shift trailing-zeros count.
const DEBRUIJN32: u32 = 0x077c_b531;

const DEBRUIJN32_TABLE: [u8; 32] = [
    0, 1, 28, 2, 29, 14, 24, 3, 30, 22, 20, 15, 25, 17, 4, 8, 31, 27, 13, 23,
    21, 19, 16, 7, 26, 12, 18, 6, 11, 5, 10, 9,
];

#[inline]
fn trailing_zeros32(x: u32) -> u32 {
    if x == 0 {
        32
    } else {
        DEBRUIJN32_TABLE[((x & x.wrapping_neg()).wrapping_mul(DEBRUIJN32) >> 27) as usize] as u32
    }
}

/// Return the number of trailing zeros in `x`, or `usize::BITS` if `x` is
/// zero.
#[inline]
pub(crate) fn trailing_zeros(x: usize) -> u32 {
    if HAS_CTZ {
        x.trailing_zeros()
    } else if usize::BITS <= 32 {
        trailing_zeros32(x as u32).min(usize::BITS)
    } else {
        let lo = trailing_zeros32(x as u32);
        if lo < 32 {
            lo
        } else {
            32 + trailing_zeros32((x as u64 >> 32) as u32).min(usize::BITS - 32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero() {
        assert_eq!(trailing_zeros(0), usize::BITS);
        assert_eq!(trailing_zeros32(0), 32);
    }

    #[test]
    fn single_bits() {
        for i in 0..usize::BITS {
            assert_eq!(trailing_zeros(1usize << i), i);
        }
        for i in 0..32 {
            assert_eq!(trailing_zeros32(1u32 << i), i);
        }
    }

    #[test]
    fn matches_intrinsic() {
        let mut x = 0x9e37_79b9_7f4a_7c15u64 as usize;
        for _ in 0..1000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            assert_eq!(trailing_zeros(x), x.trailing_zeros());
        }
    }
}
