//! rejig - parallel reconstruction of disc images from jigdo manifests
//!
//! A jigdo distribution splits a large image into a textual manifest
//! (`.jigdo`), a binary template (`.template`) carrying the bytes that
//! belong to no component file, and the component files themselves, hosted
//! on ordinary mirrors. This library rebuilds the image in place:
//!
//! - `jigdo` parses the manifest into servers and digest-addressed files
//! - `template` decodes the DESC table and the compressed data stream
//! - `image` sizes the output file and hands out mapped byte ranges
//! - `mirror` turns a digest into a fetchable source, preferring verified
//!   local copies over remote mirrors
//! - `fetch` streams a source straight into a mapped range
//! - `assemble` schedules concurrent workers over the parts, verifies each
//!   one, supports resuming a partial image, and checks the final digest
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rejig::assemble::{AssembleConfig, Assembler};
//! use rejig::fetch::HttpFetcher;
//! use rejig::image::ImageFile;
//! use rejig::jigdo::Manifest;
//! use rejig::template;
//!
//! let mut manifest = Manifest::load(Path::new("disc.jigdo"))?;
//! rejig::mirror::resolve_local_matches(&mut manifest);
//!
//! let mut template_file = File::open("disc.template")?;
//! let table = template::read_desc_table(&mut template_file)?;
//!
//! let image = Arc::new(ImageFile::create(Path::new("disc.iso"), table.image_info.size)?);
//! template::write_data_blocks(&mut template_file, &image, &table)?;
//!
//! let assembler = Assembler::new(AssembleConfig::default());
//! let report = assembler.run(
//!     image,
//!     Arc::new(manifest),
//!     &table,
//!     Arc::new(HttpFetcher::new()?),
//!     None,
//! )?;
//! println!("verified {}", report.md5);
//! ```

pub mod assemble;
pub mod compress;
pub mod fetch;
pub mod hash;
pub mod image;
pub mod jigdo;
pub mod mirror;
pub mod template;

pub use assemble::{AssembleConfig, AssembleError, AssembleReport, Assembler};
pub use hash::Md5;
pub use image::ImageFile;
pub use jigdo::Manifest;
pub use template::DescTable;
