//! Weight decoding: turns an encoded weight blob plus a memory layout into
//! the flat `f32` data buffer the layout describes.

mod eightbit;
mod raw;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::layout::{MemoryLayout, ELEMENT_SIZE};

pub use eightbit::{encode_eightbit, EightbitDecoder, CHUNK_ELEMENTS};
pub use raw::{encode_raw, RawDecoder};

/// Decodes an encoded weight blob against a memory layout.
///
/// The layout must be fully bound: a decoder fails with
/// [`Error::UnresolvedPlaceholder`] before reading any bytes if an extent is
/// still symbolic. The returned buffer covers the whole layout, static region
/// decoded from `bytes` and dynamic region zero-filled.
#[async_trait]
pub trait WeightDecoder: Send + Sync {
    /// Encoding name as it appears in graph descriptors
    fn encoding(&self) -> &'static str;

    async fn decode(&self, bytes: &[u8], layout: &MemoryLayout) -> Result<Vec<f32>>;
}

/// Select a decoder by encoding name
pub fn decoder_for(encoding: &str) -> Result<Box<dyn WeightDecoder>> {
    match encoding {
        "raw" => Ok(Box::new(RawDecoder)),
        "eightbit" => Ok(Box::new(EightbitDecoder::new())),
        other => Err(Error::UnsupportedEncoding(other.to_string())),
    }
}

/// Names accepted by [`decoder_for`]
pub const ENCODINGS: [&str; 2] = ["raw", "eightbit"];

/// Zeroed output buffer for a bound, valid layout
fn allocate_output(layout: &MemoryLayout) -> Result<Vec<f32>> {
    layout.ensure_resolved()?;
    layout.validate()?;
    Ok(vec![0.0; layout.total_size()? / ELEMENT_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_for_known_and_unknown() {
        for name in ENCODINGS {
            assert_eq!(decoder_for(name).unwrap().encoding(), name);
        }
        assert!(matches!(
            decoder_for("zstd"),
            Err(Error::UnsupportedEncoding(name)) if name == "zstd"
        ));
    }
}
