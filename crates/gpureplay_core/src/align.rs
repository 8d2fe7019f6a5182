//! Alignment arithmetic shared by the registry and the placement reconciler.

/// Default placement alignment for heaps that declare none (64 KiB)
pub const DEFAULT_HEAP_ALIGNMENT: u64 = 64 * 1024;

/// Round `offset` up to the next multiple of `alignment`.
///
/// `ceil(offset / alignment) * alignment`. An alignment of 0 or 1 leaves the
/// offset unchanged; results past `u64::MAX` saturate.
#[must_use]
pub const fn heap_aligned_offset(alignment: u64, offset: u64) -> u64 {
    if alignment <= 1 {
        return offset;
    }
    offset.div_ceil(alignment).saturating_mul(alignment)
}

/// Whether `offset` is a multiple of `alignment`
#[must_use]
pub const fn is_aligned(alignment: u64, offset: u64) -> bool {
    alignment <= 1 || offset % alignment == 0
}

/// Least common multiple of two alignments, used for alias groups
#[must_use]
pub const fn combine_alignment(a: u64, b: u64) -> u64 {
    if a <= 1 {
        return if b == 0 { 1 } else { b };
    }
    if b <= 1 {
        return a;
    }
    let (mut x, mut y) = (a, b);
    while y != 0 {
        let t = x % y;
        x = y;
        y = t;
    }
    a / x * b
}
