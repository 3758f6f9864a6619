//! node configuration, a `key:value` file:
//!
//! ```text
//! directory:./downloads
//! max_peers:32
//! port:9000
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::peers::MAX_PEERS;

pub const MIN_PORT: u16 = 1025;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("line {0}: expected `key:value`")]
    Malformed(usize),

    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),

    #[error("missing configuration key `{0}`")]
    MissingKey(&'static str),

    #[error("invalid max_peers value `{0}`, expected 1 to 2048")]
    InvalidMaxPeers(String),

    #[error("invalid port value `{0}`, expected 1025 to 65535")]
    InvalidPort(String),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("could not read configuration file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create directory {}", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// process exit status for a configuration that can't be used.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidMaxPeers(_) => 4,
            Self::InvalidPort(_) => 5,
            Self::NotADirectory(_) | Self::CreateDirectory { .. } => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub directory: PathBuf,
    pub max_peers: usize,
    pub port: u16,
}

impl Config {
    /// later lines override earlier ones, blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut directory = None;
        let mut max_peers = None;
        let mut port = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or(ConfigError::Malformed(number + 1))?;
            let value = value.trim();

            match key.trim() {
                "directory" => directory = Some(PathBuf::from(value)),
                "max_peers" => {
                    let peers = value
                        .parse::<usize>()
                        .ok()
                        .filter(|peers| (1..=MAX_PEERS).contains(peers))
                        .ok_or_else(|| ConfigError::InvalidMaxPeers(value.to_string()))?;
                    max_peers = Some(peers);
                }
                "port" => {
                    let parsed = value
                        .parse::<u16>()
                        .ok()
                        .filter(|port| *port >= MIN_PORT)
                        .ok_or_else(|| ConfigError::InvalidPort(value.to_string()))?;
                    port = Some(parsed);
                }
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }

        Ok(Self {
            directory: directory
                .filter(|dir| !dir.as_os_str().is_empty())
                .ok_or(ConfigError::MissingKey("directory"))?,
            max_peers: max_peers.ok_or(ConfigError::MissingKey("max_peers"))?,
            port: port.ok_or(ConfigError::MissingKey("port"))?,
        })
    }

    /// reads and validates the file, then makes sure the package directory exists.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::parse(&text)?;
        config.ensure_directory().await?;
        Ok(config)
    }

    async fn ensure_directory(&self) -> Result<(), ConfigError> {
        match tokio::fs::metadata(&self.directory).await {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(ConfigError::NotADirectory(self.directory.clone())),
            Err(_) => tokio::fs::create_dir_all(&self.directory)
                .await
                .map_err(|source| ConfigError::CreateDirectory {
                    path: self.directory.clone(),
                    source,
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_all_keys() {
        let config = Config::parse("directory:./pkgs\nmax_peers:2048\n\nport: 9000\n").unwrap();
        assert_eq!(
            config,
            Config {
                directory: "./pkgs".into(),
                max_peers: 2048,
                port: 9000,
            }
        );
    }

    #[rstest]
    #[case::zero_peers("max_peers:0", 4)]
    #[case::too_many_peers("max_peers:2049", 4)]
    #[case::peers_not_a_number("max_peers:many", 4)]
    #[case::privileged_port("port:1024", 5)]
    #[case::port_overflow("port:65536", 5)]
    #[case::unknown_key("colour:blue", 1)]
    #[case::no_separator("port 9000", 1)]
    fn rejects_bad_values(#[case] line: &str, #[case] exit_code: u8) {
        let text = format!("directory:d\nmax_peers:4\nport:9000\n{line}\n");
        assert_eq!(Config::parse(&text).unwrap_err().exit_code(), exit_code);
    }

    #[rstest]
    #[case("max_peers:4\nport:9000\n", "directory")]
    #[case("directory:\nmax_peers:4\nport:9000\n", "directory")]
    #[case("directory:d\nport:9000\n", "max_peers")]
    #[case("directory:d\nmax_peers:4\n", "port")]
    fn requires_every_key(#[case] text: &str, #[case] key: &str) {
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::MissingKey(missing)) if missing == key
        ));
    }

    #[tokio::test]
    async fn load_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let packages = dir.path().join("packages");
        let path = dir.path().join("config.cfg");
        tokio::fs::write(
            &path,
            format!("directory:{}\nmax_peers:8\nport:9000\n", packages.display()),
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.directory, packages);
        assert!(packages.is_dir());
    }

    #[tokio::test]
    async fn load_rejects_file_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        tokio::fs::write(&file, b"").await.unwrap();
        let path = dir.path().join("config.cfg");
        tokio::fs::write(
            &path,
            format!("directory:{}\nmax_peers:8\nport:9000\n", file.display()),
        )
        .await
        .unwrap();

        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::NotADirectory(_)));
        assert_eq!(err.exit_code(), 3);
    }
}
