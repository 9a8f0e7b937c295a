//! Splitting long waveforms into fixed-length encoder windows.

/// Split `samples` into consecutive windows of `window` samples.
///
/// The last window keeps its shorter length. Empty input yields one empty
/// window so that the encoder still sees exactly one call.
pub fn split_windows(samples: &[f32], window: usize) -> Vec<&[f32]> {
    if window == 0 || samples.len() <= window {
        return vec![samples];
    }
    samples.chunks(window).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_is_one_window() {
        let s = vec![0.0f32; 10];
        let w = split_windows(&s, 60);
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].len(), 10);
    }

    #[test]
    fn test_long_input_keeps_tail() {
        let s: Vec<f32> = (0..25).map(|i| i as f32).collect();
        let w = split_windows(&s, 10);
        assert_eq!(w.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![10, 10, 5]);
        assert_eq!(w[2][0], 20.0);
    }

    #[test]
    fn test_empty_input() {
        let w = split_windows(&[], 10);
        assert_eq!(w.len(), 1);
        assert!(w[0].is_empty());
    }
}
