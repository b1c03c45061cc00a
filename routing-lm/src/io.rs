use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::Result;

/// Opens a file and returns a buffered reader, automatically decompressing
/// based on file extension (.gz, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(flate2::read::GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Reads at most `limit` decompressed bytes from the start of a file.
///
/// Fewer bytes are returned only when the stream ends early; callers decide
/// whether that is acceptable.
pub fn read_prefix<P: AsRef<Path>>(path: P, limit: usize) -> Result<Vec<u8>> {
    let reader = open_file(path)?;
    let mut bytes = Vec::with_capacity(limit.min(1 << 27));
    reader.take(limit as u64).read_to_end(&mut bytes)?;
    Ok(bytes)
}
