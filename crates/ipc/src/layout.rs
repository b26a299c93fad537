//! Offset arithmetic for the shared regions

/// Cache line size used to separate independently locked structures
pub(crate) const CACHE_LINE: usize = 64;

/// Round `value` up to the next multiple of `align` (a power of two)
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 8), 72);
    }
}
