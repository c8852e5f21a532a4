//! Staged crack pipeline: open → parse → match → patch → repackage → sign.
//!
//! The pipeline runs strictly in stage order and checks for cancellation
//! between stages. A DEX that fails to parse aborts the whole run — a
//! half-understood binary must never be rewritten. Individual method patch
//! failures are recorded and skipped instead.

use crate::android::container::ApkContainer;
use crate::dex::error::DexError;
use crate::dex::image::{DexImage, MethodTarget};
use crate::error::{Error, Result};
use crate::matcher::{classify, BypassCategory, RULES};
use crate::signer::{sign_with_fallback, Signer};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, shared with whoever drives the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A successfully rewritten method.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedFix {
    pub category: BypassCategory,
    pub method: String,
}

/// What a crack run did: which methods were rewritten, which DEX entries
/// changed, which per-method rewrites failed, and what signed the result.
///
/// `applied_fixes` is kept even when the run fails partway — a signing
/// failure after nine rewrites still reports all nine alongside `error`.
#[derive(Debug, Serialize, Default)]
pub struct PatchOutcome {
    pub success: bool,
    pub applied_fixes: Vec<AppliedFix>,
    pub modified_entries: Vec<String>,
    pub failures: Vec<String>,
    pub signed_with: Option<String>,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

/// Per-DEX view of an analysis run.
#[derive(Debug, Serialize)]
pub struct DexReport {
    pub path: String,
    pub classes: usize,
    pub methods: usize,
    pub candidates: BTreeMap<&'static str, Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub apk: String,
    pub dex_entries: Vec<DexReport>,
}

/// The requested categories, reduced to rule-table order so that when one
/// method matches several, rewrites land deterministically.
fn active_categories(requested: &[BypassCategory]) -> Vec<BypassCategory> {
    RULES
        .iter()
        .map(|r| r.category)
        .filter(|c| requested.contains(c))
        .collect()
}

fn is_dex_entry(name: &str) -> bool {
    name.ends_with(".dex")
}

/// Match and rewrite one parsed DEX. Patch failures are collected, not
/// fatal; a failure enumerating the method tables is.
fn patch_image(
    image: &mut DexImage,
    categories: &[BypassCategory],
) -> std::result::Result<(Vec<AppliedFix>, Vec<String>), DexError> {
    let targets = image.method_targets()?;
    let mut fixes = vec![];
    let mut failures = vec![];

    for target in &targets {
        let matched = classify(&target.method.name);
        for &category in categories {
            if !matched.contains(&category) {
                continue;
            }
            apply_fix(image, target, category, &mut fixes, &mut failures);
        }
    }
    Ok((fixes, failures))
}

fn apply_fix(
    image: &mut DexImage,
    target: &MethodTarget,
    category: BypassCategory,
    fixes: &mut Vec<AppliedFix>,
    failures: &mut Vec<String>,
) {
    let name = target.method.qualified_name();
    match image.rewrite_to_constant(target, category.forced_value()) {
        Ok(()) => {
            debug!("{}: rewrote {}", category, name);
            fixes.push(AppliedFix { category, method: name });
        }
        Err(err) => {
            warn!("{}: skipping {}: {}", category, name, err);
            failures.push(format!("{}: {}: {}", category, name, err));
        }
    }
}

pub struct CrackPipeline<'a> {
    primary: &'a dyn Signer,
    fallback: &'a dyn Signer,
    cancel: CancelToken,
}

impl<'a> CrackPipeline<'a> {
    pub fn new(primary: &'a dyn Signer, fallback: &'a dyn Signer) -> CrackPipeline<'a> {
        CrackPipeline { primary, fallback, cancel: CancelToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> CrackPipeline<'a> {
        self.cancel = cancel;
        self
    }

    /// Full crack run over an APK on disk. The patched, re-signed package is
    /// written to `output`; the input file is never touched. Never panics
    /// and never returns `Err` — every failure lands in the outcome with
    /// whatever fixes were applied before it.
    pub fn run(&self, input: &Path, output: &Path, requested: &[BypassCategory]) -> PatchOutcome {
        let mut outcome = PatchOutcome::default();
        match self.run_stages(input, output, requested, &mut outcome) {
            Ok(()) => outcome.success = true,
            Err(err) => outcome.error = Some(err.to_string()),
        }
        outcome
    }

    fn run_stages(
        &self,
        input: &Path,
        output: &Path,
        requested: &[BypassCategory],
        outcome: &mut PatchOutcome,
    ) -> Result<()> {
        let categories = active_categories(requested);
        if categories.is_empty() {
            return Err(Error::Invalid("no bypass categories requested".to_string()));
        }
        info!("cracking {} for [{}]", input.display(), join_names(&categories));

        let bytes = fs::read(input)?;
        let mut container = ApkContainer::open(&bytes)?;
        let workdir = tempfile::tempdir()?;
        self.cancel.checkpoint()?;

        // Parse every .dex entry up front; one bad DEX poisons the run.
        let mut images: Vec<(String, DexImage)> = vec![];
        let dex_names: Vec<String> = container
            .entry_names()
            .filter(|n| is_dex_entry(n))
            .map(|n| n.to_string())
            .collect();
        if dex_names.is_empty() {
            return Err(Error::Invalid(format!("{} contains no .dex entries", input.display())));
        }
        for name in &dex_names {
            let data = container.read_entry(name)?;
            let image = DexImage::parse(data)
                .map_err(|source| Error::Dex { entry: name.clone(), source })?;
            debug!("{}: {} classes, {} methods", name, image.class_count(), image.method_count());
            images.push((name.clone(), image));
        }
        self.cancel.checkpoint()?;

        // Each DEX is independent; patch them on their own threads and
        // collect in spawn order so output stays deterministic.
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = images
                .into_iter()
                .map(|(name, mut image)| {
                    let categories = &categories;
                    scope.spawn(move || {
                        let outcome = patch_image(&mut image, categories);
                        (name, image, outcome)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("patch worker panicked"))
                .collect()
        });
        self.cancel.checkpoint()?;

        for (name, image, result) in results {
            let (fixes, failures) =
                result.map_err(|source| Error::Dex { entry: name.clone(), source })?;
            outcome.failures.extend(failures);
            if image.is_modified() {
                outcome.modified_entries.push(name.clone());
                container.replace_entry(&name, image.serialize())?;
            }
            outcome.applied_fixes.extend(fixes);
        }
        if outcome.applied_fixes.is_empty() {
            warn!("no methods matched [{}]; output is a re-signed copy", join_names(&categories));
        }

        let staged = workdir.path().join("staged.apk");
        fs::write(&staged, container.serialize()?)?;
        self.cancel.checkpoint()?;

        let tool = sign_with_fallback(self.primary, self.fallback, &staged)?;
        info!("signed with {}", tool);
        outcome.signed_with = Some(tool);

        fs::copy(&staged, output)?;
        outcome.output = Some(output.to_path_buf());
        info!(
            "done: {} fixes, {} entries rewritten, {} skipped",
            outcome.applied_fixes.len(),
            outcome.modified_entries.len(),
            outcome.failures.len()
        );
        Ok(())
    }
}

/// Read-only scan: which methods would each category rewrite.
pub fn analyze(input: &Path) -> Result<AnalysisReport> {
    let bytes = fs::read(input)?;
    let container = ApkContainer::open(&bytes)?;
    let mut dex_entries = vec![];

    for name in container.entry_names().filter(|n| is_dex_entry(n)) {
        let data = container.read_entry(name)?;
        let image = DexImage::parse(data)
            .map_err(|source| Error::Dex { entry: name.to_string(), source })?;

        let mut candidates: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for target in image.method_targets().map_err(|source| Error::Dex {
            entry: name.to_string(),
            source,
        })? {
            for category in classify(&target.method.name) {
                candidates
                    .entry(category.name())
                    .or_default()
                    .push(target.method.qualified_name());
            }
        }
        dex_entries.push(DexReport {
            path: name.to_string(),
            classes: image.class_count(),
            methods: image.method_count(),
            candidates,
        });
    }
    Ok(AnalysisReport { apk: input.display().to_string(), dex_entries })
}

/// Patch a bare .dex file (no container, no signing). Used when the DEX has
/// already been pulled out of its package.
pub fn patch_dex_file(
    input: &Path,
    output: &Path,
    requested: &[BypassCategory],
) -> Result<PatchOutcome> {
    let categories = active_categories(requested);
    if categories.is_empty() {
        return Err(Error::Invalid("no bypass categories requested".to_string()));
    }
    let bytes = fs::read(input)?;
    let mut image = DexImage::parse(&bytes).map_err(|source| Error::Dex {
        entry: input.display().to_string(),
        source,
    })?;

    let (fixes, failures) = patch_image(&mut image, &categories).map_err(|source| Error::Dex {
        entry: input.display().to_string(),
        source,
    })?;

    let mut outcome = PatchOutcome::default();
    outcome.applied_fixes = fixes;
    outcome.failures = failures;
    if image.is_modified() {
        outcome.modified_entries.push(input.display().to_string());
    }
    fs::write(output, image.serialize())?;
    outcome.output = Some(output.to_path_buf());
    outcome.success = true;
    Ok(outcome)
}

fn join_names(categories: &[BypassCategory]) -> String {
    categories.iter().map(|c| c.name()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_checkpoint() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(token.checkpoint(), Err(Error::Cancelled)));
        // Clones share the flag.
        assert!(token.clone().is_cancelled());
    }

    #[test]
    fn categories_reduce_to_rule_table_order() {
        let requested = [BypassCategory::Premium, BypassCategory::Root, BypassCategory::Login];
        let active = active_categories(&requested);
        assert_eq!(
            active,
            vec![BypassCategory::Login, BypassCategory::Root, BypassCategory::Premium]
        );
    }

    #[test]
    fn dex_entry_names() {
        assert!(is_dex_entry("classes.dex"));
        assert!(is_dex_entry("classes2.dex"));
        assert!(is_dex_entry("assets/bundle.dex"));
        assert!(!is_dex_entry("resources.arsc"));
        assert!(!is_dex_entry("classes.dex.bak"));
    }
}
