//! Line-oriented parser for the INI-like `.jigdo` text format.
//!
//! Sections of interest are `[Jigdo]`, `[Image]`, `[Parts]`, and
//! `[Servers]`; `[Parts]` and `[Servers]` may repeat. Other sections are
//! skipped. Comment lines start with `#`.

use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::hash::Md5;

use super::{add_mirror_value, Manifest, ManifestError, PartFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Jigdo,
    Image,
    Parts,
    Servers,
    Other,
}

pub(super) fn parse(file: File) -> Result<Manifest, ManifestError> {
    let mut manifest = Manifest::default();
    let mut section = Section::None;
    let mut version: Option<String> = None;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            section = match line {
                "[Jigdo]" => Section::Jigdo,
                "[Image]" => Section::Image,
                "[Parts]" => Section::Parts,
                "[Servers]" => Section::Servers,
                _ => Section::Other,
            };
            continue;
        }

        match section {
            Section::Jigdo => parse_jigdo_line(line, &mut version),
            Section::Image => parse_image_line(line, line_no, &mut manifest)?,
            Section::Parts => parse_parts_line(line, line_no, &mut manifest)?,
            Section::Servers => parse_servers_line(line, &mut manifest)?,
            Section::None | Section::Other => {}
        }
    }

    // A major version other than 1 signals an incompatible format change.
    match version {
        Some(ref v) if v.starts_with("1.") => {}
        found => return Err(ManifestError::UnsupportedVersion { found }),
    }

    if manifest.image_name.is_empty() {
        return Err(ManifestError::MissingField { field: "Filename" });
    }
    if manifest.template_name.is_empty() {
        return Err(ManifestError::MissingField { field: "Template" });
    }

    Ok(manifest)
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    line.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
}

fn parse_jigdo_line(line: &str, version: &mut Option<String>) {
    if let Some((key, value)) = key_value(line) {
        if key == "Version" {
            *version = Some(value.to_string());
        }
        // Generator and anything else is informational only.
    }
}

fn parse_image_line(
    line: &str,
    line_no: usize,
    manifest: &mut Manifest,
) -> Result<(), ManifestError> {
    let Some((key, value)) = key_value(line) else {
        return Ok(());
    };

    match key {
        "Filename" => manifest.image_name = value.to_string(),
        "Template" => manifest.template_name = value.to_string(),
        "Template-MD5Sum" => {
            let md5 = Md5::from_base64(value)
                .map_err(|source| ManifestError::BadDigest { line: line_no, source })?;
            manifest.template_md5 = Some(md5);
        }
        _ => {}
    }

    Ok(())
}

fn parse_parts_line(
    line: &str,
    line_no: usize,
    manifest: &mut Manifest,
) -> Result<(), ManifestError> {
    let (digest, location) =
        key_value(line).ok_or(ManifestError::BadPartLine { line: line_no })?;

    let md5 = Md5::from_base64(digest)
        .map_err(|source| ManifestError::BadDigest { line: line_no, source })?;

    let (server_name, path) = location
        .split_once(':')
        .map(|(s, p)| (s.trim(), p.trim()))
        .filter(|(s, p)| !s.is_empty() && !p.is_empty())
        .ok_or(ManifestError::BadPartLine { line: line_no })?;

    let server = manifest.server_or_insert(server_name);
    manifest.files.push(PartFile {
        md5,
        path: path.to_string(),
        server,
        local_match: None,
    });

    Ok(())
}

fn parse_servers_line(line: &str, manifest: &mut Manifest) -> Result<(), ManifestError> {
    let Some((name, value)) = key_value(line) else {
        return Err(ManifestError::BadMirror {
            value: line.to_string(),
            reason: "expected Name=URL_or_path".to_string(),
        });
    };

    let id = manifest.server_or_insert(name);
    add_mirror_value(&mut manifest.servers[id.0], value)
}
