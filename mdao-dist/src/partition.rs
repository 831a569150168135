//! Helpers for splitting a global array across ranks.

/// Split `arr_size` entries as evenly as possible into `num_divisions` contiguous blocks.
///
/// The first `arr_size % num_divisions` blocks get one extra entry. Returns `(sizes, offsets)`.
pub fn evenly_distrib_idxs(num_divisions: usize, arr_size: usize) -> (Vec<usize>, Vec<usize>) {
    if num_divisions == 0 {
        return (Vec::new(), Vec::new());
    }
    let base = arr_size / num_divisions;
    let leftover = arr_size % num_divisions;

    let sizes = (0..num_divisions)
        .map(|i| if i < leftover { base + 1 } else { base })
        .collect::<Vec<_>>();
    let offsets = offsets_from_sizes(&sizes);

    (sizes, offsets)
}

/// Exclusive prefix sum of `sizes`.
pub fn offsets_from_sizes(sizes: &[usize]) -> Vec<usize> {
    sizes
        .iter()
        .scan(0, |acc, size| {
            let offset = *acc;
            *acc += size;
            Some(offset)
        })
        .collect()
}

/// Every `n`-th item of `iter`, starting at `rank`.
pub fn take_nth<I>(rank: usize, n: usize, iter: I) -> impl Iterator<Item = I::Item>
where
    I: IntoIterator,
{
    iter.into_iter().skip(rank).step_by(n.max(1))
}
