//! The `.jigdo` manifest: servers, component files, and the parser.
//!
//! A manifest names the image and template, lists every component file by
//! its MD5 digest together with a server-relative path, and maps server
//! names to mirrors. Mirrors are either remote URLs or local directories;
//! local directories let reconstruction skip the network entirely for
//! files already on disk.

mod parser;

use std::io;
use std::path::{Path, PathBuf};

use crate::compress::{self, CompressError};
use crate::hash::{Md5, Md5DecodeError};

/// Errors from loading or amending a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The manifest could not be opened or gunzipped.
    #[error(transparent)]
    Open(#[from] CompressError),

    /// Reading the manifest text failed.
    #[error("manifest I/O error: {0}")]
    Io(#[from] io::Error),

    /// Only format major version 1 is supported.
    #[error("unsupported manifest version {found:?}")]
    UnsupportedVersion { found: Option<String> },

    /// A required `[Image]` key was missing.
    #[error("manifest is missing the {field} field")]
    MissingField { field: &'static str },

    /// A digest failed to decode.
    #[error("invalid digest on line {line}: {source}")]
    BadDigest {
        line: usize,
        source: Md5DecodeError,
    },

    /// A `[Parts]` line was not `<digest> = <server>:<path>`.
    #[error("malformed parts entry on line {line}")]
    BadPartLine { line: usize },

    /// A `[Servers]` line or `--mirror` value was not usable.
    #[error("malformed mirror definition {value:?}: {reason}")]
    BadMirror { value: String, reason: String },

    /// Runtime mirror additions require an already-known server name.
    #[error("no server named {name:?} in the manifest")]
    UnknownServer { name: String },
}

/// Index of a server within [`Manifest::servers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId(pub usize);

/// A named grouping of mirrors.
#[derive(Debug, Clone, Default)]
pub struct Server {
    /// Name as written in the manifest.
    pub name: String,
    /// Remote mirror base URLs.
    pub mirrors: Vec<String>,
    /// Local directories holding files from this server, absolute.
    pub local_dirs: Vec<PathBuf>,
}

/// One component file advertised by the manifest.
#[derive(Debug, Clone)]
pub struct PartFile {
    /// MD5 of the file contents.
    pub md5: Md5,
    /// Path relative to the server root.
    pub path: String,
    /// The server this file is fetched from.
    pub server: ServerId,
    /// Index into the server's `local_dirs` where a verified copy was
    /// found, populated by [`crate::mirror::resolve_local_matches`].
    pub local_match: Option<usize>,
}

/// A parsed `.jigdo` manifest.
///
/// After [`Manifest::load`] the file list is sorted by digest so lookups
/// from template entries are a binary search. The manifest is immutable for
/// the duration of a reconstruction.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Output image filename from `[Image]`.
    pub image_name: String,
    /// Template filename from `[Image]`.
    pub template_name: String,
    /// Advisory digest of the template file itself.
    pub template_md5: Option<Md5>,
    /// Component files, sorted by digest.
    pub files: Vec<PartFile>,
    /// Servers referenced by the files.
    pub servers: Vec<Server>,
}

impl Manifest {
    /// Load a manifest from disk, transparently gunzipping it.
    pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
        let file = compress::open_plain(path)?;
        let mut manifest = parser::parse(file)?;
        manifest.sort_files();

        tracing::info!(
            image = %manifest.image_name,
            files = manifest.files.len(),
            servers = manifest.servers.len(),
            "loaded jigdo manifest"
        );

        Ok(manifest)
    }

    /// Find a server by name.
    pub fn server_named(&self, name: &str) -> Option<ServerId> {
        self.servers
            .iter()
            .position(|s| s.name == name)
            .map(ServerId)
    }

    /// Look up a server or create an empty one with that name.
    pub fn server_or_insert(&mut self, name: &str) -> ServerId {
        match self.server_named(name) {
            Some(id) => id,
            None => {
                self.servers.push(Server {
                    name: name.to_string(),
                    ..Server::default()
                });
                ServerId(self.servers.len() - 1)
            }
        }
    }

    /// Restore the digest-sorted order that digest lookups rely on.
    pub fn sort_files(&mut self) {
        self.files.sort_by(|a, b| a.md5.cmp(&b.md5));
    }

    /// Add a mirror to an existing server from a `Name=URL_or_path` value.
    ///
    /// Local paths and `file://` URLs are canonicalized and appended to the
    /// server's local directories; anything else joins its remote mirrors.
    /// Unlike manifest parsing, this does not create unknown servers.
    pub fn add_mirror(&mut self, definition: &str) -> Result<(), ManifestError> {
        let (name, value) =
            definition
                .split_once('=')
                .ok_or_else(|| ManifestError::BadMirror {
                    value: definition.to_string(),
                    reason: "expected Name=URL_or_path".to_string(),
                })?;

        let name = name.trim();
        let id = self
            .server_named(name)
            .ok_or_else(|| ManifestError::UnknownServer {
                name: name.to_string(),
            })?;

        add_mirror_value(&mut self.servers[id.0], value)
    }
}

/// Classify and append one mirror value to a server.
///
/// Anything after the first space is dropped (options such as `--try-last`
/// are not supported).
pub(crate) fn add_mirror_value(server: &mut Server, value: &str) -> Result<(), ManifestError> {
    let value = value.trim();
    let value = value.split_whitespace().next().unwrap_or("");
    if value.is_empty() {
        return Err(ManifestError::BadMirror {
            value: value.to_string(),
            reason: "empty mirror value".to_string(),
        });
    }

    let local = if let Some(path) = value.strip_prefix("file://") {
        Some(path)
    } else if !value.contains("://") {
        Some(value)
    } else {
        None
    };

    match local {
        Some(path) => {
            let canonical =
                std::fs::canonicalize(path).map_err(|e| ManifestError::BadMirror {
                    value: value.to_string(),
                    reason: format!("cannot resolve local directory: {}", e),
                })?;
            server.local_dirs.push(canonical);
        }
        None => server.mirrors.push(value.to_string()),
    }

    Ok(())
}
