//! The MNIST IDX format.
//!
//! Labels: magic 2049, count, then one byte per label. Images: magic 2051,
//! count, rows, cols, then one byte per pixel, row major. Headers are big
//! endian `u32`.
use crate::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{ErrorKind, Read};

const LABEL_MAGIC: u32 = 2_049;
const IMAGE_MAGIC: u32 = 2_051;

fn read_header<R: Read>(reader: &mut R, magic: u32) -> Result<u32> {
    let found = read_u32(reader, 0)?;
    if found != magic {
        return Err(Error::Parse {
            position: 0,
            message: format!("magic number {found}, expected {magic}"),
        });
    }
    read_u32(reader, 4)
}

fn read_u32<R: Read>(reader: &mut R, position: usize) -> Result<u32> {
    reader
        .read_u32::<BigEndian>()
        .map_err(|e| truncated(e, position))
}

fn truncated(e: std::io::Error, position: usize) -> Error {
    if e.kind() == ErrorKind::UnexpectedEof {
        Error::Parse {
            position,
            message: "unexpected end of file".into(),
        }
    } else {
        Error::Io(e)
    }
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives so a
/// corrupt count can't allocate past the end of the stream.
fn read_bytes<R: Read>(reader: &mut R, len: usize, position: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() == len {
        Ok(bytes)
    } else {
        Err(Error::Parse {
            position: position + bytes.len(),
            message: "unexpected end of file".into(),
        })
    }
}

/// Reads labels.
///
/// **Errors**
///
/// If the magic number is wrong or the data is truncated.
pub fn parse_mnist_labels<R: Read>(mut reader: R) -> Result<Vec<usize>> {
    let count = read_header(&mut reader, LABEL_MAGIC)? as usize;
    let bytes = read_bytes(&mut reader, count, 8)?;
    Ok(bytes.into_iter().map(usize::from).collect())
}

/// Reads images, scaling pixels from `0..=255` to `scale_min..=scale_max`.
///
/// Images of `W x H` become `(W + 2 x_padding) x (H + 2 y_padding)`, the border
/// filled with `scale_min`.
///
/// **Errors**
///
/// If `scale_min >= scale_max`, the magic number is wrong, the padded image
/// size overflows, or the data is truncated.
pub fn parse_mnist_images<R: Read>(
    mut reader: R,
    scale_min: f32,
    scale_max: f32,
    x_padding: usize,
    y_padding: usize,
) -> Result<Vec<Vec<f32>>> {
    if scale_min >= scale_max {
        return Err(Error::Config(format!(
            "scale_min {scale_min} must be less than scale_max {scale_max}"
        )));
    }
    let count = read_header(&mut reader, IMAGE_MAGIC)? as usize;
    let rows = read_u32(&mut reader, 8)? as usize;
    let cols = read_u32(&mut reader, 12)? as usize;
    let overflow = || Error::Parse {
        position: 8,
        message: format!("image size {cols}x{rows} overflows usize"),
    };
    let len = rows.checked_mul(cols).ok_or_else(overflow)?;
    if len == 0 && count > 0 {
        return Err(Error::Parse {
            position: 8,
            message: format!("{count} images of {cols}x{rows} pixels"),
        });
    }
    let width = x_padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(cols))
        .ok_or_else(overflow)?;
    let height = y_padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(rows))
        .ok_or_else(overflow)?;
    let area = width.checked_mul(height).ok_or_else(overflow)?;
    let mut images = Vec::new();
    for n in 0..count {
        let pixels = read_bytes(&mut reader, len, n.saturating_mul(len).saturating_add(16))?;
        let mut image = vec![scale_min; area];
        for (y, row) in pixels.chunks_exact(cols).enumerate() {
            let start = width * (y + y_padding) + x_padding;
            for (dst, p) in image[start..start + cols].iter_mut().zip(row) {
                *dst = (*p as f32 / 255.) * (scale_max - scale_min) + scale_min;
            }
        }
        images.push(image);
    }
    Ok(images)
}
