//! Evenly spaced frame selection.

use deepfake_core::VideoSample;
use std::path::Path;

/// Pick `count` frame indices spread evenly over `available` frames.
///
/// Index `i` is `floor(i * available / count)`, or simply `i` when the two
/// counts match. The result is non-decreasing and, for
/// `available >= count`, strictly increasing. With `available < count` the
/// same index may repeat; the indexer never produces such videos.
#[must_use]
pub fn even_indices(available: usize, count: usize) -> Vec<usize> {
    if available == count {
        return (0..count).collect();
    }
    (0..count).map(|i| i * available / count).collect()
}

/// Frame paths of `sample` selected by [`even_indices`].
#[must_use]
pub fn sample_frames(sample: &VideoSample, count: usize) -> Vec<&Path> {
    even_indices(sample.frame_count(), count)
        .into_iter()
        .map(|i| sample.frames[i].as_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepfake_core::Label;
    use std::path::PathBuf;

    #[test]
    fn test_sixteen_of_thirty_two() {
        let expected: Vec<usize> = (0..16).map(|i| i * 2).collect();
        assert_eq!(even_indices(32, 16), expected);
    }

    #[test]
    fn test_identity_when_counts_match() {
        assert_eq!(even_indices(16, 16), (0..16).collect::<Vec<_>>());
        assert_eq!(even_indices(1, 1), vec![0]);
    }

    #[test]
    fn test_bounds_and_order_for_all_small_pairs() {
        for n in 1..=64 {
            for k in 1..=n {
                let idx = even_indices(n, k);
                assert_eq!(idx.len(), k, "n={n} k={k}");
                assert!(idx.iter().all(|&i| i < n), "n={n} k={k}");
                assert!(idx.windows(2).all(|w| w[0] < w[1]), "n={n} k={k}");
                assert_eq!(idx[0], 0);
            }
        }
    }

    #[test]
    fn test_uneven_ratio() {
        assert_eq!(even_indices(17, 16)[15], 15);
        assert_eq!(even_indices(33, 16)[1], 2);
        assert_eq!(even_indices(10, 4), vec![0, 2, 5, 7]);
    }

    #[test]
    fn test_fewer_frames_than_requested_repeats() {
        assert_eq!(even_indices(3, 6), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn test_sample_frames_picks_paths() {
        let sample = VideoSample {
            dir: PathBuf::from("v"),
            frames: (0..8).map(|i| PathBuf::from(format!("v/{i:03}.jpg"))).collect(),
            label: Label::Real,
        };
        let picked = sample_frames(&sample, 4);
        assert_eq!(
            picked,
            vec![
                Path::new("v/000.jpg"),
                Path::new("v/002.jpg"),
                Path::new("v/004.jpg"),
                Path::new("v/006.jpg"),
            ]
        );
    }
}
