//! Frame index selection.
//!
//! Pure arithmetic: given a clip's frame count, decide which frames represent
//! it. Nothing here touches the video itself.

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub(crate) enum SamplingStrategy {
    /// Spread samples evenly from the first to the last frame.
    #[default]
    Uniform,
    /// Take the leading frames of the clip.
    Head,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SamplingSpec {
    pub(crate) count: u32,
    pub(crate) strategy: SamplingStrategy,
}

impl SamplingSpec {
    /// `count` is clamped to at least one frame.
    pub(crate) fn new(count: u32, strategy: SamplingStrategy) -> Self {
        Self {
            count: count.max(1),
            strategy,
        }
    }
}

/// Frame positions to extract, in extraction order.
///
/// Uniform sampling computes `round(i * (total_frames - 1) / (count - 1))`
/// with ties rounded to even, so `(10, 5)` gives `[0, 2, 4, 7, 9]`. Duplicate
/// indices are kept when `count` exceeds the number of frames.
pub(crate) fn frame_indices(total_frames: u64, count: u32, strategy: SamplingStrategy) -> Vec<u64> {
    if total_frames == 0 {
        return Vec::new();
    }
    let count = u64::from(count.max(1));
    match strategy {
        SamplingStrategy::Head => (0..count.min(total_frames)).collect(),
        SamplingStrategy::Uniform if count == 1 => vec![0],
        SamplingStrategy::Uniform => {
            let span = total_frames - 1;
            let steps = count - 1;
            (0..count)
                .map(|i| div_round_half_even(u128::from(i) * u128::from(span), u128::from(steps)))
                .collect()
        }
    }
}

fn div_round_half_even(numerator: u128, denominator: u128) -> u64 {
    let quotient = numerator / denominator;
    let twice_remainder = 2 * (numerator % denominator);
    let rounded = if twice_remainder > denominator
        || (twice_remainder == denominator && quotient % 2 == 1)
    {
        quotient + 1
    } else {
        quotient
    };
    // Never exceeds total_frames - 1, which already fits in u64.
    rounded as u64
}
