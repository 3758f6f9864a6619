use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::descriptor::DescriptorError;
use super::tree::{IntegrityTree, LeafDigests, TreeError};
use super::{ChunkDescriptor, ChunkIndex, Package};
use crate::hash::{HashEngine, HexDigest};
use crate::prelude::*;

const READ_BLOCK_LEN: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("package `{0}` is not managed")]
    NotManaged(String),

    #[error("package `{0}` is already managed")]
    AlreadyManaged(String),

    #[error("chunk {0} does not belong to the package")]
    ChunkNotFound(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PackageError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Exists,
    Created,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Exists => f.write_str("File Exists"),
            FileStatus::Created => f.write_str("File Created"),
        }
    }
}

/// a package together with its backing data file and the integrity tree over it.
///
/// the package itself never changes after load. chunk completion is tracked by the tree, which
/// sits behind a lock because responses for the same package are handled by many workers.
#[derive(Debug)]
pub struct PackageStore {
    package: Package,
    path: PathBuf,
    tree: Mutex<IntegrityTree>,
}

impl PackageStore {
    /// makes sure the data file exists (creating a zero filled one of the package size if not),
    /// hashes every chunk currently on disk and builds the tree from those digests. chunks whose
    /// data already matches are marked completed.
    #[instrument(level = "debug", skip_all, fields(ident = %package.ident))]
    pub async fn open(package: Package, directory: &Path) -> Result<(Self, FileStatus), PackageError> {
        let path = directory.join(&package.filename);
        let status = ensure_file(&path, package.size).await?;

        let computed = hash_chunks(&path, &package.chunks).await?;
        let leaves: Vec<_> = package
            .chunks
            .iter()
            .zip(computed)
            .map(|(chunk, computed)| LeafDigests {
                expected: chunk.hash.clone(),
                computed,
            })
            .collect();

        let mut tree = IntegrityTree::build(&leaves, &package.hashes)?;
        for (chunk, leaf) in leaves.iter().enumerate() {
            if leaf.expected == leaf.computed {
                tree.mark_completed(chunk);
            }
        }
        debug!(
            chunks = tree.leaf_count(),
            internal = tree.internal_count(),
            depth = tree.depth(),
            root = tree.root_hash().unwrap_or("-"),
            completed = tree.completed_count(),
            "package verified against data file"
        );

        Ok((
            Self {
                package,
                path,
                tree: Mutex::new(tree),
            },
            status,
        ))
    }

    fn tree(&self) -> MutexGuard<'_, IntegrityTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn ident(&self) -> &str {
        &self.package.ident
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn file_check(&self) -> Result<FileStatus, PackageError> {
        ensure_file(&self.path, self.package.size).await
    }

    pub async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Vec<u8>, PackageError> {
        let on_err = PackageError::io(&self.path);
        let read = async {
            let mut file = File::open(&self.path).await?;
            file.seek(SeekFrom::Start(chunk.offset.into())).await?;
            let mut data = vec![0; chunk.length as usize];
            file.read_exact(&mut data).await?;
            Ok::<_, std::io::Error>(data)
        };
        read.await.map_err(on_err)
    }

    /// writes `data` at `offset` through its own file handle. callers only write disjoint,
    /// verified chunk ranges so no locking is needed around the file.
    pub async fn write_chunk(&self, offset: u32, data: &[u8]) -> Result<(), PackageError> {
        let on_err = PackageError::io(&self.path);
        let write = async {
            let mut file = OpenOptions::new().write(true).open(&self.path).await?;
            file.seek(SeekFrom::Start(offset.into())).await?;
            file.write_all(data).await?;
            file.flush().await
        };
        write.await.map_err(on_err)
    }

    pub fn mark_completed(&self, chunk: ChunkIndex) -> bool {
        self.tree().mark_completed(chunk)
    }

    pub fn is_chunk_completed(&self, chunk: ChunkIndex) -> bool {
        self.tree().is_completed(chunk)
    }

    pub fn is_complete(&self) -> bool {
        self.tree().is_complete()
    }

    pub fn all_hashes(&self) -> Vec<HexDigest> {
        self.tree().all_hashes()
    }

    pub fn completed_chunk_hashes(&self) -> Vec<HexDigest> {
        self.tree().completed_leaf_hashes()
    }

    pub fn min_completed_hashes(&self) -> Vec<HexDigest> {
        self.tree().minimal_completion_hashes()
    }

    pub fn chunk_hashes_under(&self, hash: &str) -> Result<Vec<HexDigest>, PackageError> {
        Ok(self.tree().chunk_hashes_under(hash)?)
    }
}

async fn ensure_file(path: &Path, size: u32) -> Result<FileStatus, PackageError> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(FileStatus::Exists),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), size, "creating data file");
            let file = File::create(path).await.map_err(PackageError::io(path))?;
            file.set_len(size.into())
                .await
                .map_err(PackageError::io(path))?;
            Ok(FileStatus::Created)
        }
        Err(err) => Err(PackageError::io(path)(err)),
    }
}

/// digest of whatever the file holds in each chunk range. a range running past the end of the
/// file hashes only the bytes present, which can never match the expected digest.
async fn hash_chunks(path: &Path, chunks: &[ChunkDescriptor]) -> Result<Vec<HexDigest>, PackageError> {
    let on_err = PackageError::io(path);
    let hash_all = async {
        let mut file = File::open(path).await?;
        let mut digests = Vec::with_capacity(chunks.len());
        let mut engine = HashEngine::new();
        let mut block = vec![0; READ_BLOCK_LEN];
        for chunk in chunks {
            engine.init();
            file.seek(SeekFrom::Start(chunk.offset.into())).await?;
            let mut range = (&mut file).take(chunk.length.into());
            let mut read = 0;
            loop {
                let n = range.read(&mut block).await?;
                if n == 0 {
                    break;
                }
                engine.update(&block[..n]);
                read += n;
            }
            trace!(offset = chunk.offset, read, "hashed chunk range");
            digests.push(HashEngine::to_hex(&engine.finalize()));
        }
        Ok::<_, std::io::Error>(digests)
    };
    hash_all.await.map_err(on_err)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    pub ident: String,
    pub filename: String,
    pub complete: bool,
}

/// packages managed by this node, keyed by identifier and kept in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct PackageTable {
    packages: Arc<RwLock<Vec<Arc<PackageStore>>>>,
}

impl PackageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, store: PackageStore) -> Result<Arc<PackageStore>, PackageError> {
        let mut packages = self.packages.write().unwrap_or_else(PoisonError::into_inner);
        if packages.iter().any(|p| p.ident() == store.ident()) {
            return Err(PackageError::AlreadyManaged(store.ident().to_string()));
        }
        let store = Arc::new(store);
        packages.push(Arc::clone(&store));
        Ok(store)
    }

    pub fn remove(&self, ident: &str) -> Result<Arc<PackageStore>, PackageError> {
        let mut packages = self.packages.write().unwrap_or_else(PoisonError::into_inner);
        let index = packages
            .iter()
            .position(|p| p.ident() == ident)
            .ok_or_else(|| PackageError::NotManaged(ident.to_string()))?;
        Ok(packages.remove(index))
    }

    pub fn get(&self, ident: &str) -> Option<Arc<PackageStore>> {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.ident() == ident)
            .cloned()
    }

    pub fn list(&self) -> Vec<PackageSummary> {
        self.packages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| PackageSummary {
                ident: p.ident().to_string(),
                filename: p.package().filename.clone(),
                complete: p.is_complete(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::fixtures::package_over;

    const CONTENTS: [&[u8]; 4] = [b"AAAA", b"BBBB", b"CCCC", b"DD"];

    fn data() -> Vec<u8> {
        CONTENTS.concat()
    }

    #[tokio::test]
    async fn open_creates_zeroed_file() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_over("pkg", "file.data", &CONTENTS);

        let (store, status) = PackageStore::open(package, dir.path()).await.unwrap();
        assert_eq!(status, FileStatus::Created);
        assert_eq!(status.to_string(), "File Created");

        let on_disk = tokio::fs::read(store.path()).await.unwrap();
        assert_eq!(on_disk, vec![0u8; 14]);
        assert!(store.completed_chunk_hashes().is_empty());
        assert!(store.min_completed_hashes().is_empty());
        assert!(!store.is_complete());
        assert_eq!(store.file_check().await.unwrap(), FileStatus::Exists);
    }

    #[tokio::test]
    async fn open_verifies_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_over("pkg", "file.data", &CONTENTS);
        let mut partial = data();
        partial[4..8].copy_from_slice(b"XXXX");
        tokio::fs::write(dir.path().join("file.data"), partial)
            .await
            .unwrap();

        let (store, status) = PackageStore::open(package.clone(), dir.path()).await.unwrap();
        assert_eq!(status, FileStatus::Exists);
        let expected: Vec<_> = [0, 2, 3].iter().map(|&i| package.chunks[i].hash.clone()).collect();
        assert_eq!(store.completed_chunk_hashes(), expected);
        assert!(!store.is_chunk_completed(1));
    }

    #[tokio::test]
    async fn short_file_leaves_tail_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_over("pkg", "file.data", &CONTENTS);
        tokio::fs::write(dir.path().join("file.data"), &data()[..10])
            .await
            .unwrap();

        let (store, _) = PackageStore::open(package, dir.path()).await.unwrap();
        assert!(store.is_chunk_completed(1));
        assert!(!store.is_chunk_completed(2));
        assert!(!store.is_chunk_completed(3));
    }

    #[tokio::test]
    async fn write_then_mark_completes_package() {
        let dir = tempfile::tempdir().unwrap();
        let package = package_over("pkg", "file.data", &CONTENTS);
        let (store, _) = PackageStore::open(package.clone(), dir.path()).await.unwrap();

        for (index, chunk) in package.chunks.iter().enumerate() {
            store
                .write_chunk(chunk.offset, CONTENTS[index])
                .await
                .unwrap();
            assert_eq!(store.read_chunk(chunk).await.unwrap(), CONTENTS[index]);
            assert!(store.mark_completed(index));
        }

        assert!(store.is_complete());
        assert_eq!(tokio::fs::read(store.path()).await.unwrap(), data());
        let root = package.hashes.last().unwrap().clone();
        assert_eq!(store.min_completed_hashes(), vec![root.clone()]);
        assert_eq!(store.chunk_hashes_under(&root).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn table_keys_by_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let table = PackageTable::new();

        let (first, _) = PackageStore::open(package_over("one", "one.data", &CONTENTS), dir.path())
            .await
            .unwrap();
        let (again, _) = PackageStore::open(package_over("one", "one.data", &CONTENTS), dir.path())
            .await
            .unwrap();
        let (second, _) = PackageStore::open(package_over("two", "two.data", &CONTENTS), dir.path())
            .await
            .unwrap();

        table.add(first).unwrap();
        assert!(matches!(table.add(again), Err(PackageError::AlreadyManaged(_))));
        table.add(second).unwrap();

        let listed: Vec<_> = table.list().into_iter().map(|s| s.ident).collect();
        assert_eq!(listed, ["one", "two"]);
        assert!(table.get("two").is_some());

        table.remove("one").unwrap();
        assert!(table.get("one").is_none());
        assert!(matches!(table.remove("one"), Err(PackageError::NotManaged(_))));
    }
}
