use anyhow::{Context, Result};
use std::{
    fs::File,
    io::{BufWriter, Write},
};
use tracing::info;

use crate::config::PatternConfig;

/// Writes a moving diagonal luma ramp over flat chroma, one planar 4:2:0
/// picture after another.
pub fn write_pattern(pattern: &PatternConfig) -> Result<()> {
    if let Some(parent) = pattern.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file = File::create(&pattern.path)
        .with_context(|| format!("Failed to create pattern {}", pattern.path.display()))?;
    let mut writer = BufWriter::new(file);

    let width = pattern.resolution.width as usize;
    let height = pattern.resolution.height as usize;
    let chroma = vec![128u8; pattern.resolution.raw_frame_size() - width * height];
    let mut luma = vec![0u8; width * height];

    for frame in 0..pattern.frames as usize {
        for (y, row) in luma.chunks_exact_mut(width).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = (x + y + frame * 4) as u8;
            }
        }
        writer.write_all(&luma)?;
        writer.write_all(&chroma)?;
    }

    writer
        .flush()
        .with_context(|| format!("Failed to write pattern {}", pattern.path.display()))?;

    info!(
        "Generated {} frames of {} at {}",
        pattern.frames,
        pattern.resolution,
        pattern.path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use encbench_buffer_encoder::Resolution;

    #[test]
    fn writes_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = PatternConfig {
            path: dir.path().join("nested").join("p.yuv"),
            resolution: Resolution::new(16, 8),
            frames: 3,
        };
        write_pattern(&pattern).unwrap();

        let bytes = std::fs::read(&pattern.path).unwrap();
        let frame_size = pattern.resolution.raw_frame_size();
        assert_eq!(bytes.len(), frame_size * 3);

        // first luma sample moves with the frame index
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[frame_size], 4);
        assert_eq!(bytes[2 * frame_size], 8);
        assert_eq!(bytes[frame_size - 1], 128);
    }
}
