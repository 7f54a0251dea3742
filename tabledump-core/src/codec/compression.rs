/*!
Gzip layer of the archive container.

The gzip header normally records the time of compression. Archives pin it to
a fixed epoch instead so the same logical content always compresses to the
same bytes.
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression, GzBuilder};

/// Modification time written into every gzip header and tar entry.
pub const FIXED_MTIME: u32 = 0;

/// Gzip settings for archive streams
///
/// # Example
/// ```rust
/// use tabledump_core::codec::GzipStream;
///
/// // Fast compression (less CPU, larger files)
/// let fast = GzipStream::with_level(1);
///
/// // Maximum compression (more CPU, smaller files)
/// let max = GzipStream::max();
/// assert_eq!(max.level(), 9);
/// # let _ = fast;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct GzipStream {
    compression_level: Compression,
}

impl GzipStream {
    /// Gzip with the default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Gzip with the given level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }

    /// Wrap a sink in a gzip encoder with a reproducible header.
    pub fn encoder<W: Write>(&self, sink: W) -> GzEncoder<W> {
        GzBuilder::new()
            .mtime(FIXED_MTIME)
            .write(sink, self.compression_level)
    }

    /// Wrap a source in a gzip decoder.
    pub fn decoder<R: Read>(&self, source: R) -> GzDecoder<R> {
        GzDecoder::new(source)
    }
}

impl Default for GzipStream {
    fn default() -> Self {
        Self::new()
    }
}
