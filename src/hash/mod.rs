use sha2::{Digest as _, Sha256};

pub const DIGEST_LEN: usize = 32;
pub const HEX_DIGEST_LEN: usize = DIGEST_LEN * 2;

pub type Digest = [u8; DIGEST_LEN];

/// lowercase hex rendering of a [`Digest`], this is what peers and descriptors compare.
pub type HexDigest = String;

/// streaming sha-256.
#[derive(Debug, Clone, Default)]
pub struct HashEngine {
    state: Sha256,
}

impl HashEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// drops everything fed so far.
    pub fn init(&mut self) {
        self.state = Sha256::new();
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.state.update(bytes);
    }

    /// produces the digest of everything fed since the last `init`, leaving the engine reset.
    pub fn finalize(&mut self) -> Digest {
        self.state.finalize_reset().into()
    }

    pub fn to_hex(digest: &Digest) -> HexDigest {
        hex::encode(digest)
    }

    /// one-shot helper, hashes `bytes` and renders the digest.
    pub fn hex_digest_of(bytes: impl AsRef<[u8]>) -> HexDigest {
        let mut engine = Self::new();
        engine.update(bytes);
        Self::to_hex(&engine.finalize())
    }
}

pub fn is_hex_digest(candidate: &str) -> bool {
    candidate.len() == HEX_DIGEST_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}
