//! TIFF frame decoding
//!
//! Area detectors write single-channel frames as 16/32-bit integer or 32-bit
//! float TIFFs. Frames are returned as `rows x columns` arrays of `f32`.

use crate::error::{GeometryError, Result};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};

fn unsupported(path: &Path, reason: impl Into<String>) -> GeometryError {
    GeometryError::UnsupportedImage {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn to_f32<T: Copy + Into<f64>>(buf: &[T]) -> Vec<f32> {
    buf.iter().map(|&v| v.into() as f32).collect()
}

/// Decode a single-channel TIFF into a `rows x columns` array
pub fn read_tiff(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    // Large detector frames exceed the decoder's default buffer limits
    let mut decoder =
        Decoder::new(BufReader::new(File::open(path)?))?.with_limits(Limits::unlimited());

    match decoder.colortype()? {
        tiff::ColorType::Gray(_) => {},
        other => return Err(unsupported(path, format!("expected a grayscale frame, got {:?}", other))),
    }

    let (width, height) = decoder.dimensions()?;
    let pixels = match decoder.read_image()? {
        DecodingResult::U8(buf) => to_f32(&buf),
        DecodingResult::U16(buf) => to_f32(&buf),
        DecodingResult::U32(buf) => to_f32(&buf),
        DecodingResult::I8(buf) => to_f32(&buf),
        DecodingResult::I16(buf) => to_f32(&buf),
        DecodingResult::I32(buf) => to_f32(&buf),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.iter().map(|&v| v as f32).collect(),
        DecodingResult::U64(_) | DecodingResult::I64(_) => {
            return Err(unsupported(path, "64-bit integer samples are not supported"));
        },
    };

    Array2::from_shape_vec((height as usize, width as usize), pixels)
        .map_err(|e| unsupported(path, format!("pixel count does not match {}x{}: {}", width, height, e)))
}

/// Write a frame as a 32-bit float grayscale TIFF
///
/// Used to store derived masks and by tests that need real frames on disk.
pub fn write_tiff(path: impl AsRef<Path>, frame: &Array2<f32>) -> Result<()> {
    let (rows, cols) = frame.dim();
    let data: Vec<f32> = frame.iter().copied().collect();
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    encoder.write_image::<colortype::Gray32Float>(cols as u32, rows as u32, &data)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_float_frame_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.tif");
        let frame = array![[0.0f32, 1.5, -2.0], [3.25, 4.0, 1e6]];

        write_tiff(&path, &frame).unwrap();
        let decoded = read_tiff(&path).unwrap();

        assert_eq!(decoded.dim(), (2, 3));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_u16_frame_is_widened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.tif");
        let data: Vec<u16> = vec![0, 10, 65535, 7];
        {
            let file = BufWriter::new(File::create(&path).unwrap());
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder.write_image::<colortype::Gray16>(2, 2, &data).unwrap();
        }

        let decoded = read_tiff(&path).unwrap();
        assert_eq!(decoded, array![[0.0f32, 10.0], [65535.0, 7.0]]);
    }

    #[test]
    fn test_rgb_frame_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.tif");
        {
            let file = BufWriter::new(File::create(&path).unwrap());
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder.write_image::<colortype::RGB8>(1, 1, &[1u8, 2, 3]).unwrap();
        }

        assert!(matches!(
            read_tiff(&path),
            Err(GeometryError::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn test_truncated_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half_written.tif");
        std::fs::write(&path, b"II*\0").unwrap();
        assert!(read_tiff(&path).is_err());
    }
}
