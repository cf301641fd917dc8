use crate::error::{TableError, TableResult};


/// Per-block compression, identified by the one-byte id in each block
/// trailer. Ids are part of the file format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None = 0,
    #[default]
    Snappy = 1,
}

impl Compression {
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> TableResult<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            other => Err(TableError::corruption(format!(
                "unknown block compression id {other}"
            ))),
        }
    }

    /// Compress `input`, replacing the contents of `output`.
    ///
    /// `Compression::Snappy` falls back to storing uncompressed when the
    /// crate is built without the `snappy-compression` feature; the block
    /// trailer records what was actually written, so readers are unaffected.
    pub fn encode(self, input: &[u8], output: &mut Vec<u8>) -> TableResult<Self> {
        output.clear();
        match self {
            Self::None => {
                output.extend(input);
                Ok(Self::None)
            }
            Self::Snappy => {
                #[cfg(feature = "snappy-compression")]
                {
                    output.resize(snap::raw::max_compress_len(input.len()), 0);
                    let compressed_len = snap::raw::Encoder::new()
                        .compress(input, output)
                        .map_err(|err| {
                            TableError::corruption(format!("snappy compression failed: {err}"))
                        })?;
                    output.truncate(compressed_len);
                    Ok(Self::Snappy)
                }
                #[cfg(not(feature = "snappy-compression"))]
                {
                    output.extend(input);
                    Ok(Self::None)
                }
            }
        }
    }

    /// Decompress `input`, replacing the contents of `output`.
    ///
    /// Failure to decompress data that claims to be compressed is a
    /// corruption error, as is snappy data in a build without snappy.
    pub fn decode(self, input: &[u8], output: &mut Vec<u8>) -> TableResult<()> {
        output.clear();
        match self {
            Self::None => {
                output.extend(input);
                Ok(())
            }
            Self::Snappy => {
                #[cfg(feature = "snappy-compression")]
                {
                    let decompressed_len = snap::raw::decompress_len(input).map_err(|err| {
                        TableError::corruption(format!("bad snappy header: {err}"))
                    })?;
                    output.resize(decompressed_len, 0);
                    snap::raw::Decoder::new().decompress(input, output).map_err(|err| {
                        TableError::corruption(format!("snappy decompression failed: {err}"))
                    })?;
                    Ok(())
                }
                #[cfg(not(feature = "snappy-compression"))]
                {
                    Err(TableError::corruption(
                        "block is snappy-compressed, but snappy support is not compiled in",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn id_round_trip() {
        assert_eq!(Compression::from_id(0).unwrap(), Compression::None);
        assert_eq!(Compression::from_id(1).unwrap(), Compression::Snappy);
        assert!(Compression::from_id(2).is_err());
    }

    #[test]
    fn encode_decode_round_trip() {
        let input: Vec<u8> = b"some compressible data "
            .iter()
            .copied()
            .cycle()
            .take(4096)
            .collect();

        for requested in [Compression::None, Compression::Snappy] {
            let mut compressed = Vec::new();
            let written = requested.encode(&input, &mut compressed).unwrap();

            let mut decompressed = Vec::new();
            written.decode(&compressed, &mut decompressed).unwrap();
            assert_eq!(decompressed, input);
        }
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn snappy_actually_compresses() {
        let input = vec![b'x'; 4096];
        let mut compressed = Vec::new();
        assert_eq!(
            Compression::Snappy.encode(&input, &mut compressed).unwrap(),
            Compression::Snappy,
        );
        assert!(compressed.len() < input.len());
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn garbage_snappy_is_corruption() {
        let mut output = Vec::new();
        assert!(Compression::Snappy.decode(b"\xff\xff\xff\xff", &mut output).is_err());
    }
}
