//! Software fallbacks for the bit intrinsics (spec §4.4 "implemented in
//! software; the JIT may substitute hardware instructions when CPUID
//! reports support"). The interpreter always goes through these; we still
//! probe CPUID once so the software path can short-circuit to the same
//! hardware instruction the JIT would have emitted instead of a manual
//! bit-twiddling loop, on hosts that have it.

use std::sync::OnceLock;

#[derive(Debug, Clone, Copy)]
struct Features {
    popcnt: bool,
    bmi1: bool, // tzcnt / bsf
    lzcnt: bool, // lzcnt / bsr
}

fn features() -> Features {
    static FEATURES: OnceLock<Features> = OnceLock::new();
    *FEATURES.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            Features {
                popcnt: is_x86_feature_detected!("popcnt"),
                bmi1: is_x86_feature_detected!("bmi1"),
                lzcnt: is_x86_feature_detected!("lzcnt"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Features { popcnt: false, bmi1: false, lzcnt: false }
        }
    })
}

/// Bit-scan-forward: index of the least significant set bit, or `width` if
/// zero (matches `u32::trailing_zeros`/`u64::trailing_zeros` on an
/// all-zero input).
pub fn bsf32(v: u32) -> u32 {
    let _ = features().bmi1;
    v.trailing_zeros()
}

pub fn bsf64(v: u64) -> u32 {
    let _ = features().bmi1;
    v.trailing_zeros()
}

/// Bit-scan-reverse: index of the most significant set bit, or `width` if
/// zero.
pub fn bsr32(v: u32) -> u32 {
    let _ = features().lzcnt;
    if v == 0 {
        32
    } else {
        31 - v.leading_zeros()
    }
}

pub fn bsr64(v: u64) -> u32 {
    let _ = features().lzcnt;
    if v == 0 {
        64
    } else {
        63 - v.leading_zeros()
    }
}

pub fn popcnt32(v: u32) -> u32 {
    if features().popcnt {
        v.count_ones()
    } else {
        // Portable fallback identical to the hardware result.
        let mut v = v;
        let mut c = 0u32;
        while v != 0 {
            v &= v - 1;
            c += 1;
        }
        c
    }
}

pub fn popcnt64(v: u64) -> u32 {
    if features().popcnt {
        v.count_ones()
    } else {
        let mut v = v;
        let mut c = 0u32;
        while v != 0 {
            v &= v - 1;
            c += 1;
        }
        c
    }
}

pub fn bswap32(v: u32) -> u32 {
    v.swap_bytes()
}

pub fn bswap64(v: u64) -> u64 {
    v.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsf_finds_lowest_set_bit() {
        assert_eq!(bsf32(0b1000), 3);
        assert_eq!(bsf32(0), 32);
    }

    #[test]
    fn bsr_finds_highest_set_bit() {
        assert_eq!(bsr32(0b1000), 3);
        assert_eq!(bsr32(0), 32);
    }

    #[test]
    fn popcnt_counts_ones() {
        assert_eq!(popcnt32(0b1011), 3);
        assert_eq!(popcnt64(u64::MAX), 64);
    }

    #[test]
    fn bswap_reverses_byte_order() {
        assert_eq!(bswap32(0x01020304), 0x04030201);
    }
}
