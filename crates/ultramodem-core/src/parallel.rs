//! Ordered parallel synthesis
//!
//! Frames and dwell windows are independent, so they are rendered on the
//! rayon pool and stitched back together in input order. Without the
//! `parallel` feature the same functions run sequentially.
//!
//! ```toml
//! [dependencies]
//! ultramodem-core = { version = "0.1", default-features = false }  # sequential
//! ```

use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// `f(0), f(1), ... f(count - 1)`, computed concurrently, returned in order.
#[cfg(feature = "parallel")]
pub fn map_indexed<R, F>(count: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    (0..count).into_par_iter().map(f).collect()
}

#[cfg(not(feature = "parallel"))]
pub fn map_indexed<R, F>(count: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(usize) -> R + Sync + Send,
{
    (0..count).map(f).collect()
}

/// Render each index in `range` into a block of `block_len` samples and
/// concatenate the blocks in index order.
pub fn render_blocks<F>(range: Range<usize>, block_len: usize, render: F) -> Vec<f32>
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    let count = range.len();
    let start = range.start;
    let mut out = vec![0.0f32; count * block_len];
    if block_len == 0 {
        return out;
    }

    #[cfg(feature = "parallel")]
    {
        out.par_chunks_mut(block_len)
            .enumerate()
            .for_each(|(i, block)| render(start + i, block));
    }

    #[cfg(not(feature = "parallel"))]
    {
        out.chunks_mut(block_len)
            .enumerate()
            .for_each(|(i, block)| render(start + i, block));
    }

    out
}

/// Split `0..total` into consecutive ranges of at most `batch` items.
pub fn batches(total: usize, batch: usize) -> impl Iterator<Item = Range<usize>> {
    let batch = batch.max(1);
    (0..total)
        .step_by(batch)
        .map(move |start| start..(start + batch).min(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_indexed_preserves_order() {
        let squares = map_indexed(1000, |i| i * i);
        assert!(squares.iter().enumerate().all(|(i, &v)| v == i * i));
    }

    #[test]
    fn test_render_blocks_in_order() {
        let out = render_blocks(3..6, 4, |i, block| block.fill(i as f32));
        assert_eq!(out.len(), 12);
        assert_eq!(&out[..4], &[3.0; 4]);
        assert_eq!(&out[8..], &[5.0; 4]);
    }

    #[test]
    fn test_batches_cover_range() {
        let ranges: Vec<_> = batches(10, 4).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
        assert_eq!(batches(0, 4).count(), 0);
        assert_eq!(batches(3, 0).count(), 3);
    }
}
