//! dexpatch - binary patching of Android APK/DEX packages.
//!
//! Opens an APK, locates methods whose names look like protection checks
//! (login gates, purchase verification, root and debugger detection,
//! certificate pinning, premium flags), rewrites their bodies in place to
//! return a fixed verdict, reseals each DEX (SHA-1 signature + Adler-32
//! checksum), repackages the archive byte-preservingly and re-signs it.

pub mod android;
pub mod dex;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod signer;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use matcher::BypassCategory;
pub use pipeline::{analyze, patch_dex_file, AnalysisReport, CrackPipeline, PatchOutcome};

use signer::{ApkSignerTool, JarSignerTool};
use std::path::Path;

/// Crack `input` for the given categories and write the signed result to
/// `output`, using the standard apksigner-then-jarsigner tool chain.
pub fn crack_apk(input: &Path, output: &Path, categories: &[BypassCategory]) -> PatchOutcome {
    CrackPipeline::new(&ApkSignerTool, &JarSignerTool).run(input, output, categories)
}
