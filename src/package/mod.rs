pub mod descriptor;
pub mod store;
pub mod tree;

use bitvec::vec::BitVec;

use crate::hash::HexDigest;

pub use store::{FileStatus, PackageError, PackageStore, PackageTable};
pub use tree::{IntegrityTree, LeafDigests};

pub type Bitfield = BitVec;
pub type ChunkIndex = usize;

pub const MAX_IDENT_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub hash: HexDigest,
    pub offset: u32,
    pub length: u32,
}

impl ChunkDescriptor {
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.length)
    }
}

/// a managed package as described by its descriptor file. completion state is not part of the
/// package, it lives in the [`IntegrityTree`] built over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub ident: String,
    pub filename: String,
    pub size: u32,
    /// expected digests of the internal tree nodes, in construction order.
    pub hashes: Vec<HexDigest>,
    pub chunks: Vec<ChunkDescriptor>,
}

impl Package {
    /// finds a chunk by its expected hash. several chunks may share a hash (repeated content), in
    /// which case the one starting at `offset` wins, otherwise the first one.
    pub fn find_chunk(&self, hash: &str, offset: Option<u32>) -> Option<(ChunkIndex, &ChunkDescriptor)> {
        let hash = hash.to_ascii_lowercase();
        let mut candidates = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.hash == hash);

        let first = candidates.next()?;
        match offset {
            Some(offset) if first.1.offset != offset => Some(
                std::iter::once(first)
                    .chain(candidates)
                    .find(|(_, chunk)| chunk.offset == offset)
                    .unwrap_or(first),
            ),
            _ => Some(first),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::hash::HashEngine;

    /// builds a package over `contents`, one chunk per slice, with consistent expected hashes for
    /// every leaf and internal node.
    pub fn package_over(ident: &str, filename: &str, contents: &[&[u8]]) -> Package {
        let mut offset = 0u32;
        let chunks: Vec<_> = contents
            .iter()
            .map(|data| {
                let chunk = ChunkDescriptor {
                    hash: HashEngine::hex_digest_of(data),
                    offset,
                    length: data.len() as u32,
                };
                offset += data.len() as u32;
                chunk
            })
            .collect();

        let leaves: Vec<_> = chunks.iter().map(|c| c.hash.clone()).collect();
        Package {
            ident: ident.to_string(),
            filename: filename.to_string(),
            size: offset,
            hashes: tree::internal_digests(&leaves),
            chunks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(hash: char, offset: u32) -> ChunkDescriptor {
        ChunkDescriptor {
            hash: hash.to_string().repeat(64),
            offset,
            length: 4,
        }
    }

    #[test]
    fn find_chunk_prefers_matching_offset() {
        let package = Package {
            ident: "pkg".into(),
            filename: "file.data".into(),
            size: 12,
            hashes: vec![],
            chunks: vec![chunk('a', 0), chunk('b', 4), chunk('a', 8)],
        };

        let hash = "a".repeat(64);
        assert_eq!(package.find_chunk(&hash, None).map(|(i, _)| i), Some(0));
        assert_eq!(package.find_chunk(&hash, Some(8)).map(|(i, _)| i), Some(2));
        assert_eq!(package.find_chunk(&hash, Some(4)).map(|(i, _)| i), Some(0));
        assert_eq!(
            package.find_chunk(&"B".repeat(64), None).map(|(i, _)| i),
            Some(1)
        );
        assert!(package.find_chunk(&"c".repeat(64), None).is_none());
    }
}
