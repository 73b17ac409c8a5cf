//! Portable kernels. Every accelerated kernel must agree with these.

/// Exact byte equality
#[inline]
pub fn equals(value: &[u8], target: &[u8]) -> bool {
    value == target
}

/// Substring search; an empty needle matches everything
#[inline]
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Inclusive numeric range over a parsed column; NaN slots never match
pub fn range_f64(values: &[f64], lo: f64, hi: f64, base: usize, out: &mut Vec<usize>) {
    for (idx, &value) in values.iter().enumerate() {
        if value >= lo && value <= hi {
            out.push(base + idx);
        }
    }
}

/// Inclusive byte-wise range; `hi == None` is unbounded above
#[inline]
pub fn range_bytes(value: &[u8], lo: &[u8], hi: Option<&[u8]>) -> bool {
    value >= lo && hi.is_none_or(|hi| value <= hi)
}
