use std::fmt;
use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use serde::{Deserialize, Serialize};

/// The scheme used to compress generated payloads before they are stored.
///
/// The scheme is part of every [`RequestKey`](super::RequestKey), so entries written under one
/// scheme are never read back with another.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Payloads are stored as they were generated.
    None,
    #[default]
    Gzip,
    Zlib,
    Zstd,
}

impl Compression {
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
            Compression::Zstd => "zstd",
        }
    }

    /// Compresses a freshly generated payload.
    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        metric!(time_raw("compression.input_size") = data.len() as u64, "type" => self.name());

        let compressed = match self {
            Compression::None => return Ok(Bytes::copy_from_slice(data)),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Compression::Zstd => zstd::stream::encode_all(data, 0)?,
        };

        metric!(time_raw("compression.output_size") = compressed.len() as u64, "type" => self.name());
        Ok(compressed.into())
    }

    /// Restores a payload that was compressed with this scheme.
    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decompressed = Vec::new();
        match self {
            Compression::None => return Ok(Bytes::copy_from_slice(data)),
            Compression::Gzip => {
                // `MultiGzDecoder` accepts a strict superset of what `GzDecoder` does.
                MultiGzDecoder::new(data).read_to_end(&mut decompressed)?;
            }
            Compression::Zlib => {
                ZlibDecoder::new(data).read_to_end(&mut decompressed)?;
            }
            Compression::Zstd => {
                decompressed = zstd::stream::decode_all(data)?;
            }
        }
        Ok(decompressed.into())
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
