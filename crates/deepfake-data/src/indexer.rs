//! Frame-folder indexing.
//!
//! Expected layout: `root/{real,fake}/<video_id>/<frame>.<ext>`. Class
//! directories are visited in label order, video directories in sorted name
//! order, and frames are sorted by path so sampling is deterministic.

use deepfake_core::{ClassCounts, DataConfig, DeepfakeError, Label, Result, VideoSample};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Index every video under `config.root` with at least
/// [`DataConfig::effective_min_frames`] frames.
///
/// A missing class directory is skipped.
///
/// # Errors
///
/// Returns [`DeepfakeError::EmptyDataset`] when no video qualifies, or an I/O
/// error if a directory cannot be listed.
pub fn index_videos(config: &DataConfig) -> Result<Vec<VideoSample>> {
    let min_frames = config.effective_min_frames();
    let mut samples = Vec::new();
    let mut counts = ClassCounts::default();
    let mut skipped = 0usize;

    for label in Label::ALL {
        let class_dir = config.root.join(label.dir_name());
        if !class_dir.is_dir() {
            debug!(dir = %class_dir.display(), "Class directory missing, skipping");
            continue;
        }

        for video_dir in sorted_subdirs(&class_dir)? {
            let frames = list_frames(&video_dir, &config.frame_extensions)?;
            if frames.len() < min_frames {
                debug!(
                    dir = %video_dir.display(),
                    frames = frames.len(),
                    min_frames,
                    "Too few frames, skipping video"
                );
                skipped += 1;
                continue;
            }
            counts.add(label);
            samples.push(VideoSample {
                dir: video_dir,
                frames,
                label,
            });
        }
    }

    info!(
        root = %config.root.display(),
        total = samples.len(),
        real = counts.real,
        fake = counts.fake,
        skipped,
        "Indexed videos"
    );

    if samples.is_empty() {
        return Err(DeepfakeError::EmptyDataset {
            root: config.root.clone(),
        });
    }
    Ok(samples)
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn list_frames(video_dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(video_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_frame_file(path, extensions))
        .collect();
    frames.sort();
    Ok(frames)
}

// Hidden files are ignored, like a shell glob would.
fn is_frame_file(path: &Path, extensions: &[String]) -> bool {
    let visible = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| !n.starts_with('.'));
    let ext_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x == e));
    visible && ext_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_video(root: &Path, class: &str, name: &str, frames: usize) {
        let dir = root.join(class).join(name);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..frames {
            fs::write(dir.join(format!("{i:04}.jpg")), b"").unwrap();
        }
    }

    fn config_for(root: &Path, frames: usize) -> DataConfig {
        DataConfig {
            root: root.to_path_buf(),
            frames_per_video: frames,
            ..DataConfig::default()
        }
    }

    #[test]
    fn test_excludes_short_videos_and_counts_both_classes() {
        let tmp = TempDir::new().unwrap();
        make_video(tmp.path(), "real", "r1", 4);
        make_video(tmp.path(), "real", "r2", 3);
        make_video(tmp.path(), "real", "r3", 9);
        make_video(tmp.path(), "fake", "f1", 4);
        make_video(tmp.path(), "fake", "f2", 0);

        let samples = index_videos(&config_for(tmp.path(), 4)).unwrap();
        let names: Vec<_> = samples
            .iter()
            .map(|s| s.dir.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["r1", "r3", "f1"]);
        let counts = ClassCounts::from_samples(&samples);
        assert_eq!(counts.real, 2);
        assert_eq!(counts.fake, 1);
        assert_eq!(samples[1].frame_count(), 9);
    }

    #[test]
    fn test_missing_class_directory_is_skipped() {
        let tmp = TempDir::new().unwrap();
        make_video(tmp.path(), "fake", "f1", 5);
        let samples = index_videos(&config_for(tmp.path(), 5)).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].label, Label::Fake);
    }

    #[test]
    fn test_empty_dataset_is_an_error() {
        let tmp = TempDir::new().unwrap();
        make_video(tmp.path(), "real", "r1", 2);
        let err = index_videos(&config_for(tmp.path(), 4)).unwrap_err();
        assert!(matches!(err, DeepfakeError::EmptyDataset { .. }));
    }

    #[test]
    fn test_frames_sorted_and_filtered_by_extension() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("real").join("v");
        fs::create_dir_all(&dir).unwrap();
        for name in ["b.jpg", "a.jpg", "c.png", "d.JPG", ".hidden.jpg", "notes.txt"] {
            fs::write(dir.join(name), b"").unwrap();
        }
        fs::create_dir_all(dir.join("nested.jpg")).unwrap();

        let samples = index_videos(&config_for(tmp.path(), 2)).unwrap();
        let frames: Vec<_> = samples[0]
            .frames
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(frames, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_min_frames_override() {
        let tmp = TempDir::new().unwrap();
        make_video(tmp.path(), "real", "r1", 4);
        make_video(tmp.path(), "real", "r2", 8);
        let config = DataConfig {
            min_frames: Some(8),
            ..config_for(tmp.path(), 4)
        };
        let samples = index_videos(&config).unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_stray_files_in_class_directory_ignored() {
        let tmp = TempDir::new().unwrap();
        make_video(tmp.path(), "real", "r1", 3);
        fs::write(tmp.path().join("real").join("README"), b"x").unwrap();
        let samples = index_videos(&config_for(tmp.path(), 3)).unwrap();
        assert_eq!(samples.len(), 1);
    }
}
