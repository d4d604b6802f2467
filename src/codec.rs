//! Chunk payload codecs. All encodings are defined over the same canonical
//! element order: little-endian values, x fastest, then y, z, and channel
//! slowest.

use crate::error::{Result, VoxError};
use crate::types::{DataType, Voxel};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ndarray::{Array4, ArrayView4, ShapeBuilder};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

const JPEG_QUALITY: u8 = 85;

/// Chunk payload encoding, as named in the scale descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Uncompressed little-endian dump
    #[serde(rename = "raw")]
    Raw,
    /// Lossy; uint8 image layers only
    #[serde(rename = "jpeg")]
    Jpeg,
    /// Deflate over the raw dump; lossless, for label volumes
    #[serde(rename = "compressed_labels")]
    CompressedLabels,
}

impl Encoding {
    /// Raw payloads are the only ones worth compressing at the storage layer
    pub fn wants_storage_compression(&self) -> bool {
        matches!(self, Encoding::Raw)
    }
}

/// Serializes a chunk view into the canonical raw byte order.
pub fn encode_raw<T: Voxel>(view: ArrayView4<'_, T>) -> Vec<u8> {
    let (sx, sy, sz, sc) = view.dim();
    let mut out = Vec::with_capacity(sx * sy * sz * sc * T::DATA_TYPE.size_in_bytes());
    for c in 0..sc {
        for z in 0..sz {
            for y in 0..sy {
                for x in 0..sx {
                    view[[x, y, z, c]].write_le(&mut out);
                }
            }
        }
    }
    out
}

/// Deserializes a raw payload into an (x, y, z, channel) array.
pub fn decode_raw<T: Voxel>(
    bytes: &[u8],
    shape: [usize; 3],
    channels: usize,
) -> Result<Array4<T>> {
    let width = T::DATA_TYPE.size_in_bytes();
    let count = shape[0] * shape[1] * shape[2] * channels;
    if bytes.len() != count * width {
        return Err(VoxError::Codec(format!(
            "raw payload is {} bytes, expected {} for shape {:?} x {} channels of {}",
            bytes.len(),
            count * width,
            shape,
            channels,
            T::DATA_TYPE
        )));
    }

    let values: Vec<T> = bytes.chunks_exact(width).map(T::read_le).collect();
    // raw order is column-major over (x, y, z, c)
    Array4::from_shape_vec((shape[0], shape[1], shape[2], channels).f(), values)
        .map_err(|e| VoxError::Codec(e.to_string()))
}

fn encode_jpeg(raw: &[u8], shape: [usize; 3], channels: usize) -> Result<Vec<u8>> {
    let width = shape[0] as u32;
    let height = (shape[1] * shape[2] * channels) as u32;
    let mut out = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    encoder
        .encode(raw, width, height, image::ExtendedColorType::L8)
        .map_err(|e| VoxError::Codec(format!("jpeg encode failed: {}", e)))?;
    Ok(out)
}

fn decode_jpeg(bytes: &[u8], shape: [usize; 3], channels: usize) -> Result<Vec<u8>> {
    let img = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .map_err(|e| VoxError::Codec(format!("jpeg decode failed: {}", e)))?
        .into_luma8();
    let width = shape[0] as u32;
    let height = (shape[1] * shape[2] * channels) as u32;
    if img.width() != width || img.height() != height {
        return Err(VoxError::Codec(format!(
            "jpeg chunk is {}x{}, expected {}x{}",
            img.width(),
            img.height(),
            width,
            height
        )));
    }
    Ok(img.into_raw())
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Serializes one mesh fragment: u32 vertex count, the f32 vertex triples,
/// then the u32 face index buffer, all little-endian.
pub fn encode_mesh_fragment(vertices: &[f32], faces: &[u32]) -> Result<Vec<u8>> {
    if vertices.len() % 3 != 0 {
        return Err(VoxError::Codec(format!(
            "mesh vertex buffer of {} floats is not a whole number of triples",
            vertices.len()
        )));
    }
    let mut out =
        Vec::with_capacity(4 + vertices.len() * 4 + faces.len() * 4);
    out.extend_from_slice(&((vertices.len() / 3) as u32).to_le_bytes());
    for v in vertices {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for f in faces {
        out.extend_from_slice(&f.to_le_bytes());
    }
    Ok(out)
}

/// Encodes a chunk view with the given encoding.
pub fn encode<T: Voxel>(encoding: Encoding, view: ArrayView4<'_, T>) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Raw => Ok(encode_raw(view)),
        Encoding::Jpeg => {
            if T::DATA_TYPE != DataType::U8 {
                return Err(VoxError::Codec(format!(
                    "jpeg encoding requires uint8 data, got {}",
                    T::DATA_TYPE
                )));
            }
            let (sx, sy, sz, _) = view.dim();
            encode_jpeg(&encode_raw(view), [sx, sy, sz], view.dim().3)
        }
        Encoding::CompressedLabels => deflate(&encode_raw(view)),
    }
}

/// Decodes a chunk payload of known shape.
pub fn decode<T: Voxel>(
    encoding: Encoding,
    bytes: &[u8],
    shape: [usize; 3],
    channels: usize,
) -> Result<Array4<T>> {
    match encoding {
        Encoding::Raw => decode_raw(bytes, shape, channels),
        Encoding::Jpeg => {
            if T::DATA_TYPE != DataType::U8 {
                return Err(VoxError::Codec(format!(
                    "jpeg encoding requires uint8 data, got {}",
                    T::DATA_TYPE
                )));
            }
            let raw = decode_jpeg(bytes, shape, channels)?;
            decode_raw(&raw, shape, channels)
        }
        Encoding::CompressedLabels => decode_raw(&inflate(bytes)?, shape, channels),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_raw_element_order() {
        // x varies fastest, channel slowest
        let mut chunk = Array4::<u8>::zeros((2, 2, 1, 1));
        chunk[[0, 0, 0, 0]] = 1;
        chunk[[1, 0, 0, 0]] = 2;
        chunk[[0, 1, 0, 0]] = 3;
        chunk[[1, 1, 0, 0]] = 4;
        assert_eq!(encode_raw(chunk.view()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_raw_little_endian() {
        let mut chunk = Array4::<u16>::zeros((1, 1, 1, 1));
        chunk[[0, 0, 0, 0]] = 0x0102;
        assert_eq!(encode_raw(chunk.view()), vec![0x02, 0x01]);
    }

    #[test]
    fn test_raw_roundtrip_multichannel() {
        let chunk = Array4::from_shape_fn((4, 3, 2, 3), |(x, y, z, c)| {
            (x + 10 * y + 100 * z + 1000 * c) as u32
        });
        let bytes = encode(Encoding::Raw, chunk.view()).unwrap();
        let decoded = decode::<u32>(Encoding::Raw, &bytes, [4, 3, 2], 3).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_raw_length_mismatch() {
        let err = decode::<u8>(Encoding::Raw, &[0u8; 7], [2, 2, 2], 1).unwrap_err();
        assert!(matches!(err, VoxError::Codec(_)));
    }

    #[test]
    fn test_compressed_labels_roundtrip() {
        let chunk = Array4::from_shape_fn((8, 8, 8, 1), |(x, y, z, _)| {
            ((x / 4) + 2 * (y / 4) + 4 * (z / 4)) as u64
        });
        let bytes = encode(Encoding::CompressedLabels, chunk.view()).unwrap();
        assert!(bytes.len() < encode_raw(chunk.view()).len());
        let decoded = decode::<u64>(Encoding::CompressedLabels, &bytes, [8, 8, 8], 1).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_jpeg_uniform_chunk() {
        let chunk = Array4::<u8>::from_elem((16, 16, 4, 1), 128);
        let bytes = encode(Encoding::Jpeg, chunk.view()).unwrap();
        let decoded = decode::<u8>(Encoding::Jpeg, &bytes, [16, 16, 4], 1).unwrap();
        assert_eq!(decoded.dim(), chunk.dim());
        for &v in decoded.iter() {
            assert!((v as i16 - 128).abs() <= 1, "jpeg drifted to {}", v);
        }
    }

    #[test]
    fn test_jpeg_rejects_wide_types() {
        let chunk = Array4::<u16>::zeros((4, 4, 4, 1));
        assert!(encode(Encoding::Jpeg, chunk.view()).is_err());
    }

    #[test]
    fn test_mesh_fragment_layout() {
        let vertices = [0.0f32, 1.0, 2.0, 4.0, 5.0, 6.0];
        let faces = [0u32, 1, 0];
        let bytes = encode_mesh_fragment(&vertices, &faces).unwrap();
        assert_eq!(bytes.len(), 4 + 6 * 4 + 3 * 4);
        assert_eq!(&bytes[..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.0f32.to_le_bytes());
        assert_eq!(&bytes[28..32], &0u32.to_le_bytes());

        assert!(encode_mesh_fragment(&vertices[..2], &faces).is_err());
    }

    #[test]
    fn test_encoding_json_names() {
        assert_eq!(serde_json::to_string(&Encoding::Raw).unwrap(), "\"raw\"");
        assert_eq!(
            serde_json::to_string(&Encoding::CompressedLabels).unwrap(),
            "\"compressed_labels\""
        );
        let e: Encoding = serde_json::from_str("\"jpeg\"").unwrap();
        assert_eq!(e, Encoding::Jpeg);
    }
}
