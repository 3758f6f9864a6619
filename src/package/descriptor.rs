//! parser for the line oriented package descriptor:
//!
//! ```text
//! ident:<identifier>
//! filename:<data file>
//! size:<bytes>
//! nhashes:<n>
//! hashes:
//!     <64 hex digits>      (n lines)
//! nchunks:<m>
//! chunks:
//!     <hash>,<offset>,<length>   (m lines)
//! ```
//!
//! the `hashes:` and `chunks:` header lines are optional, blank lines are skipped.

use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

use super::{ChunkDescriptor, Package, MAX_IDENT_LEN};
use crate::hash::{is_hex_digest, HexDigest};

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("could not read descriptor: {0}")]
    Io(#[from] std::io::Error),
}

fn malformed(line: usize, reason: impl Into<String>) -> DescriptorError {
    DescriptorError::Malformed {
        line,
        reason: reason.into(),
    }
}

struct Cursor<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
    last_line: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        let lines: Vec<_> = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .collect();
        let last_line = text.lines().count();
        Self {
            lines,
            pos: 0,
            last_line,
        }
    }

    fn next(&mut self, expecting: &str) -> Result<(usize, &'a str), DescriptorError> {
        let line = self.lines.get(self.pos).copied().ok_or_else(|| {
            malformed(
                self.last_line + 1,
                format!("unexpected end of descriptor, expected {expecting}"),
            )
        })?;
        self.pos += 1;
        Ok(line)
    }

    fn skip_header(&mut self, header: &str) {
        if self.lines.get(self.pos).is_some_and(|(_, line)| *line == header) {
            self.pos += 1;
        }
    }

    fn field(&mut self, key: &str) -> Result<(usize, &'a str), DescriptorError> {
        let (number, line) = self.next(key)?;
        let value = line
            .strip_prefix(key)
            .ok_or_else(|| malformed(number, format!("expected `{key}`")))?;
        Ok((number, value.trim()))
    }

    fn number<T: FromStr>(&mut self, key: &str) -> Result<T, DescriptorError> {
        let (number, value) = self.field(key)?;
        value
            .parse()
            .map_err(|_| malformed(number, format!("`{value}` is not a valid {key} value")))
    }
}

fn digest(line: usize, candidate: &str) -> Result<HexDigest, DescriptorError> {
    if !is_hex_digest(candidate) {
        return Err(malformed(line, format!("`{candidate}` is not a sha-256 hex digest")));
    }
    Ok(candidate.to_ascii_lowercase())
}

fn parse_chunk(line: usize, text: &str) -> Result<ChunkDescriptor, DescriptorError> {
    let mut parts = text.split(',').map(str::trim);
    let (Some(hash), Some(offset), Some(length), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(line, "chunk lines are `hash,offset,length`"));
    };

    Ok(ChunkDescriptor {
        hash: digest(line, hash)?,
        offset: offset
            .parse()
            .map_err(|_| malformed(line, format!("`{offset}` is not a valid chunk offset")))?,
        length: length
            .parse()
            .map_err(|_| malformed(line, format!("`{length}` is not a valid chunk length")))?,
    })
}

pub fn parse(text: &str) -> Result<Package, DescriptorError> {
    let mut cursor = Cursor::new(text);

    let (line, ident) = cursor.field("ident:")?;
    if ident.is_empty() || ident.len() > MAX_IDENT_LEN {
        return Err(malformed(
            line,
            format!("identifier must be 1 to {MAX_IDENT_LEN} bytes"),
        ));
    }

    let (line, filename) = cursor.field("filename:")?;
    if filename.is_empty() {
        return Err(malformed(line, "filename is empty"));
    }

    let size: u32 = cursor.number("size:")?;

    let nhashes: usize = cursor.number("nhashes:")?;
    cursor.skip_header("hashes:");
    let hashes = (0..nhashes)
        .map(|_| {
            let (line, text) = cursor.next("an internal hash")?;
            digest(line, text)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let nchunks: usize = cursor.number("nchunks:")?;
    cursor.skip_header("chunks:");
    // grows with the lines actually present, nchunks is untrusted
    let mut chunks = Vec::new();
    for _ in 0..nchunks {
        let (line, text) = cursor.next("a chunk")?;
        let chunk = parse_chunk(line, text)?;
        if chunk.end() > u64::from(size) {
            return Err(malformed(line, format!("chunk extends past the {size} byte file")));
        }
        chunks.push(chunk);
    }

    if let Some(&(line, _)) = cursor.lines.get(cursor.pos) {
        return Err(malformed(line, "unexpected content after the chunk list"));
    }

    Ok(Package {
        ident: ident.to_string(),
        filename: filename.to_string(),
        size,
        hashes,
        chunks,
    })
}

pub async fn load(path: impl AsRef<Path>) -> Result<Package, DescriptorError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse(&text)
}
