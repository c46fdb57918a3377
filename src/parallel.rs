use rayon::prelude::*;
use std::ops::Range;

/// Intra layer parallelism.
///
/// When enabled, layers split independent per channel loops into rayon tasks
/// of at least `grain_size` channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parallelism {
    pub(crate) enabled: bool,
    pub(crate) grain_size: usize,
}

impl Parallelism {
    pub(crate) fn new(enabled: bool, grain_size: usize) -> Self {
        Self {
            enabled,
            grain_size: grain_size.max(1),
        }
    }
    pub(crate) fn serial() -> Self {
        Self::new(false, 1)
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::serial()
    }
}

/// Runs `f(index, chunk)` over `chunk_size` chunks of `data`.
pub(crate) fn for_each_chunk_mut<T, F>(
    data: &mut [T],
    chunk_size: usize,
    parallelism: Parallelism,
    f: F,
) where
    T: Send,
    F: Fn(usize, &mut [T]) + Send + Sync,
{
    if chunk_size == 0 {
        return;
    }
    if parallelism.enabled {
        data.par_chunks_mut(chunk_size)
            .with_min_len(parallelism.grain_size)
            .enumerate()
            .for_each(|(i, chunk)| f(i, chunk));
    } else {
        data.chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(i, chunk)| f(i, chunk));
    }
}

/// Splits `len` items into `parts` contiguous ranges.
///
/// Every range gets `len / parts` items, the last one also takes the
/// remainder.
pub(crate) fn partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, len.max(1));
    let chunk = len / parts;
    (0..parts)
        .map(|i| {
            let start = i * chunk;
            let end = if i + 1 == parts { len } else { start + chunk };
            start..end
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_remainder_to_last() {
        assert_eq!(partition(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(partition(4, 4), vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(partition(2, 8), vec![0..1, 1..2]);
        assert_eq!(partition(5, 1), vec![0..5]);
    }

    #[test]
    fn chunks_parallel_and_serial_agree() {
        let mut a = vec![0usize; 12];
        let mut b = vec![0usize; 12];
        let f = |i: usize, chunk: &mut [usize]| chunk.iter_mut().for_each(|x| *x = i);
        for_each_chunk_mut(&mut a, 4, Parallelism::new(true, 1), f);
        for_each_chunk_mut(&mut b, 4, Parallelism::serial(), f);
        assert_eq!(a, b);
        assert_eq!(a[11], 2);
    }
}
