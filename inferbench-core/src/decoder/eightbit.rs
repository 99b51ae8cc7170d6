//! Eight bit logarithmic weight encoding.
//!
//! The blob is a sequence of chunks:
//!
//! ```text
//! dst_offset : i32 LE   element index of the first decoded value
//! body_size  : i32 LE   number of code bytes that follow the header
//! scale      : f32 LE   absolute maximum of the chunk
//! _reserved  : 4 bytes
//! codes      : u8 * body_size
//! ```
//!
//! A code decodes to `TABLE[code & 0x7f] * scale`, negated when the high bit
//! is set. The table is logarithmic with eight steps per octave and
//! `TABLE[0] == 0.0`, `TABLE[127] == 1.0`.

use async_trait::async_trait;
use tracing::debug;

use super::{allocate_output, WeightDecoder};
use crate::error::{Error, Result};
use crate::layout::{MemoryLayout, ELEMENT_SIZE};

/// Elements per chunk produced by [`encode_eightbit`]
pub const CHUNK_ELEMENTS: usize = 1024 * 1024;

const HEADER_SIZE: usize = 16;
const SIGN_BIT: u8 = 0x80;

fn decode_table() -> [f32; 128] {
    let mut table = [0.0f32; 128];
    for (i, entry) in table.iter_mut().enumerate().skip(1) {
        *entry = 2f32.powf((i as f32 - 127.0) / 8.0);
    }
    table
}

#[derive(Debug, Clone)]
pub struct EightbitDecoder {
    table: [f32; 128],
}

impl Default for EightbitDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EightbitDecoder {
    pub fn new() -> Self {
        Self {
            table: decode_table(),
        }
    }

    /// 256 entry lookup table for one chunk's scale
    fn scaled_table(&self, scale: f32) -> [f32; 256] {
        let mut scaled = [0.0f32; 256];
        for (code, entry) in scaled.iter_mut().enumerate() {
            let magnitude = self.table[code & 0x7f] * scale;
            *entry = if code < 128 { magnitude } else { -magnitude };
        }
        scaled
    }
}

#[async_trait]
impl WeightDecoder for EightbitDecoder {
    fn encoding(&self) -> &'static str {
        "eightbit"
    }

    async fn decode(&self, bytes: &[u8], layout: &MemoryLayout) -> Result<Vec<f32>> {
        let mut output = allocate_output(layout)?;
        let static_elements = layout.static_region.size / ELEMENT_SIZE;

        let mut cursor = 0;
        let mut chunks = 0;
        while cursor < bytes.len() {
            let header = bytes.get(cursor..cursor + HEADER_SIZE).ok_or_else(|| {
                Error::CorruptWeights(format!("truncated chunk header at byte {}", cursor))
            })?;
            let dst_offset = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let body_size = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let scale = f32::from_le_bytes([header[8], header[9], header[10], header[11]]);

            let (dst_offset, body_size) =
                match (usize::try_from(dst_offset), usize::try_from(body_size)) {
                    (Ok(offset), Ok(size)) => (offset, size),
                    _ => {
                        return Err(Error::CorruptWeights(format!(
                            "negative offset or size in chunk header at byte {}",
                            cursor
                        )))
                    }
                };
            if dst_offset + body_size > static_elements {
                return Err(Error::CorruptWeights(format!(
                    "chunk {}..{} exceeds the static region ({} elements)",
                    dst_offset,
                    dst_offset + body_size,
                    static_elements
                )));
            }

            let body_start = cursor + HEADER_SIZE;
            let body = bytes.get(body_start..body_start + body_size).ok_or_else(|| {
                Error::CorruptWeights(format!("truncated chunk body at byte {}", body_start))
            })?;

            let scaled = self.scaled_table(scale);
            for (dst, &code) in output[dst_offset..dst_offset + body_size]
                .iter_mut()
                .zip(body)
            {
                *dst = scaled[code as usize];
            }

            cursor = body_start + body_size;
            chunks += 1;
        }
        debug!(chunks, static_elements, "Decoded eightbit weights");

        Ok(output)
    }
}

/// Encode values in the eightbit format, one chunk per [`CHUNK_ELEMENTS`]
pub fn encode_eightbit(values: &[f32]) -> Vec<u8> {
    let table = decode_table();
    let mut out = Vec::with_capacity(values.len() + HEADER_SIZE);

    for (index, chunk) in values.chunks(CHUNK_ELEMENTS).enumerate() {
        let max = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let scale = if max > 0.0 { max } else { 1.0 };

        out.extend_from_slice(&((index * CHUNK_ELEMENTS) as i32).to_le_bytes());
        out.extend_from_slice(&(chunk.len() as i32).to_le_bytes());
        out.extend_from_slice(&scale.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);

        out.extend(chunk.iter().map(|&v| {
            let code = nearest_code(&table, v.abs() / scale);
            if v < 0.0 {
                code | SIGN_BIT
            } else {
                code
            }
        }));
    }

    out
}

fn nearest_code(table: &[f32; 128], magnitude: f32) -> u8 {
    let upper = table.partition_point(|&t| t < magnitude).min(127);
    if upper == 0 {
        return 0;
    }
    let lower = upper - 1;
    if magnitude - table[lower] <= table[upper] - magnitude {
        lower as u8
    } else {
        upper as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Placeholder, PlaceholderContext};

    fn layout_for(elements: usize) -> MemoryLayout {
        let mut layout = MemoryLayout::new();
        layout.push_static("w", elements * ELEMENT_SIZE);
        layout
    }

    #[test]
    fn test_table_endpoints_and_monotonic() {
        let table = decode_table();
        assert_eq!(table[0], 0.0);
        assert_eq!(table[127], 1.0);
        assert!(table.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_powers_of_two_survive_encoding() {
        let values = [1.0, -0.5, 0.0, 0.25, -1.0];
        let encoded = encode_eightbit(&values);
        assert_eq!(encoded.len(), HEADER_SIZE + values.len());

        let decoded = EightbitDecoder::new()
            .decode(&encoded, &layout_for(values.len()))
            .await
            .unwrap();

        for (expected, actual) in values.iter().zip(&decoded) {
            assert!((expected - actual).abs() < 1e-6, "{} vs {}", expected, actual);
        }
    }

    #[tokio::test]
    async fn test_relative_error_is_bounded_by_table_step() {
        let values: Vec<f32> = (1..200).map(|i| (i as f32 * 0.37).sin() * 3.0).collect();
        let encoded = encode_eightbit(&values);
        let decoded = EightbitDecoder::new()
            .decode(&encoded, &layout_for(values.len()))
            .await
            .unwrap();

        let scale = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        for (expected, actual) in values.iter().zip(&decoded) {
            if expected.abs() / scale > 1e-3 {
                assert!(
                    ((expected - actual) / expected).abs() < 0.05,
                    "{} vs {}",
                    expected,
                    actual
                );
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_body_fails() {
        let mut encoded = encode_eightbit(&[0.5, 0.5, 0.5]);
        encoded.pop();

        let err = EightbitDecoder::new()
            .decode(&encoded, &layout_for(3))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CorruptWeights(_)));
    }

    #[tokio::test]
    async fn test_chunk_outside_static_region_fails() {
        let encoded = encode_eightbit(&[0.5; 8]);

        let err = EightbitDecoder::new()
            .decode(&encoded, &layout_for(4))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CorruptWeights(_)));
    }

    #[tokio::test]
    async fn test_unresolved_layout_fails_before_reading() {
        let mut layout = layout_for(2);
        layout
            .push_dynamic("x", 0usize, 4usize)
            .set_dynamic_size(Placeholder::named("N"));

        let err = EightbitDecoder::new()
            .decode(&[0xff; 3], &layout)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedPlaceholder(_)));

        let bound = layout.bind(&PlaceholderContext::new().with("N", 4)).unwrap();
        let decoded = EightbitDecoder::new()
            .decode(&encode_eightbit(&[1.0, 1.0]), &bound)
            .await
            .unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2], 0.0);
    }
}
