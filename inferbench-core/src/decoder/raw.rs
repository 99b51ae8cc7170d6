use async_trait::async_trait;
use tracing::debug;

use super::{allocate_output, WeightDecoder};
use crate::error::{Error, Result};
use crate::layout::{MemoryLayout, ELEMENT_SIZE};

/// Little-endian IEEE-754 `f32` values, one per element of the static region
#[derive(Debug, Default, Clone, Copy)]
pub struct RawDecoder;

#[async_trait]
impl WeightDecoder for RawDecoder {
    fn encoding(&self) -> &'static str {
        "raw"
    }

    async fn decode(&self, bytes: &[u8], layout: &MemoryLayout) -> Result<Vec<f32>> {
        let mut output = allocate_output(layout)?;

        let expected = layout.static_region.size;
        if bytes.len() != expected {
            return Err(Error::WeightSizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        for (dst, chunk) in output.iter_mut().zip(bytes.chunks_exact(ELEMENT_SIZE)) {
            *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        debug!(
            static_elements = expected / ELEMENT_SIZE,
            total_elements = output.len(),
            "Decoded raw weights"
        );

        Ok(output)
    }
}

/// Encode values in the raw format
pub fn encode_raw(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
