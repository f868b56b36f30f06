//! Content-addressed source selection: digest lookup, local-directory
//! probing, and mirror choice.

use rand::Rng;
use tracing::debug;

use crate::hash::Md5;
use crate::jigdo::{Manifest, PartFile};

/// Errors from resolving a digest to a fetchable source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The manifest does not advertise this digest at all.
    #[error("no manifest entry for digest {md5}")]
    UnknownDigest { md5: Md5 },

    /// The file's server has neither a local copy nor a remote mirror.
    #[error("server {server:?} has no usable mirrors")]
    NoSource { server: String },
}

/// All manifest entries whose digest equals `md5`.
///
/// The file list is sorted by digest, so this is a binary search extended
/// left and right to cover duplicates. Returns an empty slice on a miss.
pub fn find_by_md5<'a>(manifest: &'a Manifest, md5: &Md5) -> &'a [PartFile] {
    let files = &manifest.files;
    let Ok(hit) = files.binary_search_by(|f| f.md5.cmp(md5)) else {
        return &[];
    };

    let mut start = hit;
    while start > 0 && files[start - 1].md5 == *md5 {
        start -= 1;
    }

    let mut end = hit + 1;
    while end < files.len() && files[end].md5 == *md5 {
        end += 1;
    }

    &files[start..end]
}

/// Probe a file's server-local directories for a verified copy.
///
/// Directories are tried in order; the first whose `dir/relative_path`
/// exists with a matching digest wins.
pub fn find_local_copy(manifest: &Manifest, file: &PartFile) -> Option<usize> {
    let server = &manifest.servers[file.server.0];

    for (index, dir) in server.local_dirs.iter().enumerate() {
        let candidate = dir.join(&file.path);
        if candidate.exists() && Md5::of_path(&candidate) == file.md5 {
            debug!(path = %candidate.display(), "found verified local copy");
            return Some(index);
        }
    }

    None
}

/// Populate `local_match` for every file in the manifest.
///
/// Runs once before assembly; the manifest is treated as immutable from
/// then on. Returns the number of files with a local copy.
pub fn resolve_local_matches(manifest: &mut Manifest) -> usize {
    let mut matches = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        matches.push(find_local_copy(manifest, file));
    }

    let mut found = 0;
    for (file, local_match) in manifest.files.iter_mut().zip(matches) {
        if local_match.is_some() {
            found += 1;
        }
        file.local_match = local_match;
    }

    found
}

/// Choose a source URL for one manifest entry.
///
/// A local match takes priority and is returned as a `file://` URL.
/// Otherwise one of the server's remote mirrors is chosen uniformly at
/// random, so retries naturally spread over the mirror set.
pub fn select_source(manifest: &Manifest, file: &PartFile) -> Result<String, ResolveError> {
    let server = &manifest.servers[file.server.0];

    if let Some(dir_index) = file.local_match {
        let path = server.local_dirs[dir_index].join(&file.path);
        return Ok(format!("file://{}", path.display()));
    }

    if server.mirrors.is_empty() {
        return Err(ResolveError::NoSource {
            server: server.name.clone(),
        });
    }

    let pick = rand::thread_rng().gen_range(0..server.mirrors.len());
    Ok(join_url(&server.mirrors[pick], &file.path))
}

/// Resolve a digest straight to a fetchable URL.
///
/// When several manifest entries share the digest they all name the same
/// bytes; an entry with a local match is preferred, otherwise the first.
pub fn source_for_md5(manifest: &Manifest, md5: &Md5) -> Result<String, ResolveError> {
    let matches = find_by_md5(manifest, md5);
    let file = matches
        .iter()
        .find(|f| f.local_match.is_some())
        .or_else(|| matches.first())
        .ok_or(ResolveError::UnknownDigest { md5: *md5 })?;
    select_source(manifest, file)
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}
