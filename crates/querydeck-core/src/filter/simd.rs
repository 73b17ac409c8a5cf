//! AVX2 kernels (x86_64)
//!
//! Byte kernels compare 32 bytes per instruction; the numeric range kernel
//! evaluates 4 `f64` bounds checks per instruction. Tails fall back to the
//! scalar kernels so results are identical on every input.
//!
//! Callers must check [`is_available`] before calling any kernel.

use std::arch::x86_64::*;

use super::scalar;

/// Check if AVX2 is available
#[inline]
pub fn is_available() -> bool {
    is_x86_feature_detected!("avx2")
}

/// AVX2 byte equality
///
/// # Safety
/// The CPU must support AVX2.
#[target_feature(enable = "avx2")]
pub unsafe fn equals(value: &[u8], target: &[u8]) -> bool {
    if value.len() != target.len() {
        return false;
    }
    let len = value.len();
    let mut i = 0;
    while i + 32 <= len {
        let eq = unsafe {
            let a = _mm256_loadu_si256(value.as_ptr().add(i) as *const __m256i);
            let b = _mm256_loadu_si256(target.as_ptr().add(i) as *const __m256i);
            _mm256_movemask_epi8(_mm256_cmpeq_epi8(a, b))
        };
        if eq != -1 {
            return false;
        }
        i += 32;
    }
    value[i..] == target[i..]
}

/// AVX2 substring search
///
/// Candidate positions are those where both the first and the last needle
/// byte match; each candidate is then verified with a full comparison.
///
/// # Safety
/// The CPU must support AVX2.
#[target_feature(enable = "avx2")]
pub unsafe fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    let n = needle.len();
    if n == 0 {
        return true;
    }
    if haystack.len() < n {
        return false;
    }

    // Highest valid start position
    let last_start = haystack.len() - n;
    let mut i = 0;

    while i + 32 <= last_start + 1 {
        let mut mask = unsafe {
            let first = _mm256_set1_epi8(needle[0] as i8);
            let last = _mm256_set1_epi8(needle[n - 1] as i8);
            let block_first = _mm256_loadu_si256(haystack.as_ptr().add(i) as *const __m256i);
            let block_last =
                _mm256_loadu_si256(haystack.as_ptr().add(i + n - 1) as *const __m256i);
            let eq = _mm256_and_si256(
                _mm256_cmpeq_epi8(first, block_first),
                _mm256_cmpeq_epi8(last, block_last),
            );
            _mm256_movemask_epi8(eq) as u32
        };
        while mask != 0 {
            let bit = mask.trailing_zeros() as usize;
            if &haystack[i + bit..i + bit + n] == needle {
                return true;
            }
            mask &= mask - 1;
        }
        i += 32;
    }

    scalar::contains(&haystack[i..], needle)
}

/// AVX2 inclusive range over parsed numeric values
///
/// # Safety
/// The CPU must support AVX2.
#[target_feature(enable = "avx2")]
pub unsafe fn range_f64(values: &[f64], lo: f64, hi: f64, base: usize, out: &mut Vec<usize>) {
    let len = values.len();
    let chunks = len / 4;

    for chunk_idx in 0..chunks {
        let offset = chunk_idx * 4;
        // Ordered, non-signalling compares: NaN yields false
        let mask = unsafe {
            let lo_vec = _mm256_set1_pd(lo);
            let hi_vec = _mm256_set1_pd(hi);
            let data = _mm256_loadu_pd(values.as_ptr().add(offset));
            let ge = _mm256_cmp_pd::<_CMP_GE_OQ>(data, lo_vec);
            let le = _mm256_cmp_pd::<_CMP_LE_OQ>(data, hi_vec);
            _mm256_movemask_pd(_mm256_and_pd(ge, le)) as u32
        };
        for lane in 0..4 {
            if mask & (1 << lane) != 0 {
                out.push(base + offset + lane);
            }
        }
    }

    let remainder_start = chunks * 4;
    scalar::range_f64(
        &values[remainder_start..],
        lo,
        hi,
        base + remainder_start,
        out,
    );
}
