//! End-to-end runs over the synthetic Security fixture: analyze, crack an
//! APK, patch a bare DEX, and the failure/cancellation paths.

use super::fixtures::{build_apk_with_dex, build_security_apk, build_security_dex, SecurityDex, CLASS_DESC};
use crate::android::container::ApkContainer;
use crate::dex::image::{verify_seal, DexImage};
use crate::matcher::BypassCategory;
use crate::pipeline::{analyze, patch_dex_file, CancelToken, CrackPipeline};
use crate::signer::{NoopSigner, SignError, Signer};
use std::fs;
use std::path::{Path, PathBuf};

fn write_fixture_apk(dir: &tempfile::TempDir) -> (PathBuf, Vec<u8>, SecurityDex) {
    let dex = build_security_dex();
    let apk = build_security_apk(&dex.bytes);
    let path = dir.path().join("app.apk");
    fs::write(&path, &apk).unwrap();
    (path, apk, dex)
}

fn read_u16_at(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn read_u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

struct BrokenSigner;

impl Signer for BrokenSigner {
    fn sign(&self, _apk: &Path) -> Result<(), SignError> {
        Err(SignError::Failed { tool: "broken".into(), detail: "no keystore".into() })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

#[test]
fn fixture_dex_parses_and_verifies() {
    let dex = build_security_dex();
    verify_seal(&dex.bytes).unwrap();
    let image = DexImage::parse(&dex.bytes).unwrap();
    assert_eq!(image.class_count(), 1);
    assert_eq!(image.method_count(), 5);

    let names: Vec<String> = image
        .method_targets()
        .unwrap()
        .iter()
        .map(|t| t.method.qualified_name())
        .collect();
    assert_eq!(
        names,
        vec![
            format!("{}->checkRootAccess()Z", CLASS_DESC),
            format!("{}->detectRoot()Z", CLASS_DESC),
            format!("{}->getScore()I", CLASS_DESC),
            format!("{}->isPremium()Z", CLASS_DESC),
            format!("{}->isRooted()Z", CLASS_DESC),
        ]
    );
}

#[test]
fn analyze_lists_candidates_per_category() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);

    let report = analyze(&apk_path).unwrap();
    assert_eq!(report.dex_entries.len(), 1);
    let entry = &report.dex_entries[0];
    assert_eq!(entry.path, "classes.dex");
    assert_eq!(entry.classes, 1);
    assert_eq!(entry.methods, 5);
    assert_eq!(
        entry.candidates.get("root"),
        Some(&vec![
            format!("{}->checkRootAccess()Z", CLASS_DESC),
            format!("{}->detectRoot()Z", CLASS_DESC),
            format!("{}->isRooted()Z", CLASS_DESC),
        ])
    );
    assert_eq!(
        entry.candidates.get("premium"),
        Some(&vec![format!("{}->isPremium()Z", CLASS_DESC)])
    );
    assert!(entry.candidates.get("login").is_none());
}

#[test]
fn crack_rewrites_root_check_and_reseals() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, fixture) = write_fixture_apk(&dir);
    let out_path = dir.path().join("app-cracked.apk");

    let pipeline = CrackPipeline::new(&NoopSigner, &NoopSigner);
    let outcome = pipeline.run(&apk_path, &out_path, &[BypassCategory::Root]);

    assert!(outcome.success, "run failed: {:?}", outcome.error);
    assert_eq!(outcome.applied_fixes.len(), 1);
    assert_eq!(outcome.applied_fixes[0].method, format!("{}->isRooted()Z", CLASS_DESC));
    assert_eq!(outcome.modified_entries, vec!["classes.dex".to_string()]);
    assert_eq!(outcome.signed_with.as_deref(), Some("noop"));

    // The two unpatchable root checks are reported, not fatal.
    assert_eq!(outcome.failures.len(), 2);
    assert!(outcome.failures[0].contains("checkRootAccess"));
    assert!(outcome.failures[0].contains("larger than original"));
    assert!(outcome.failures[1].contains("detectRoot"));
    assert!(outcome.failures[1].contains("no code item"));

    let cracked = ApkContainer::open(&fs::read(&out_path).unwrap()).unwrap();
    let dex = cracked.read_entry("classes.dex").unwrap();
    verify_seal(dex).unwrap();
    DexImage::parse(dex).unwrap();

    // checkRootAccess keeps its 1-unit body.
    let tiny = fixture.tiny_off as usize;
    assert_eq!(read_u32_at(dex, tiny + 12), 1);
    assert_eq!(read_u16_at(dex, tiny + 16), 0x000F);

    // isRooted: boolean false body, nop-filled slack, metadata zeroed.
    let off = fixture.code_offs[2] as usize;
    assert_eq!(read_u16_at(dex, off), 1); // registers_size shrunk to ins
    assert_eq!(read_u16_at(dex, off + 4), 0); // outs_size
    assert_eq!(read_u16_at(dex, off + 6), 0); // tries_size
    assert_eq!(read_u32_at(dex, off + 8), 0); // debug_info_off
    assert_eq!(read_u32_at(dex, off + 12), 2); // insns_size
    assert_eq!(read_u16_at(dex, off + 16), 0x0012); // const/4 v0, #0
    assert_eq!(read_u16_at(dex, off + 18), 0x000F); // return v0
    assert_eq!(read_u16_at(dex, off + 20), 0x0000); // nop
}

#[test]
fn crack_leaves_bystanders_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, original, fixture) = write_fixture_apk(&dir);
    let out_path = dir.path().join("app-cracked.apk");

    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &out_path, &[BypassCategory::Root]);
    assert!(outcome.success);

    let before = ApkContainer::open(&original).unwrap();
    let after = ApkContainer::open(&fs::read(&out_path).unwrap()).unwrap();
    let names_before: Vec<_> = before.entry_names().collect();
    let names_after: Vec<_> = after.entry_names().collect();
    assert_eq!(names_before, names_after);
    for name in ["AndroidManifest.xml", "resources.arsc"] {
        assert_eq!(before.read_entry(name).unwrap(), after.read_entry(name).unwrap());
    }

    // getScore and isPremium keep their original bodies.
    let dex = after.read_entry("classes.dex").unwrap();
    for &off in &fixture.code_offs[..2] {
        let off = off as usize;
        assert_eq!(read_u32_at(dex, off + 12), 3);
        assert_eq!(read_u16_at(dex, off + 16), 0x0013); // const/16 v0, #lit
        assert_eq!(read_u16_at(dex, off + 20), 0x000F); // return v0
    }
}

#[test]
fn crack_with_no_matches_changes_no_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);
    let out_path = dir.path().join("app-cracked.apk");

    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &out_path, &[BypassCategory::Cert]);
    assert!(outcome.success);
    assert!(outcome.applied_fixes.is_empty());
    assert!(outcome.modified_entries.is_empty());

    // The repackaged DEX is the verbatim original.
    let before = build_security_dex();
    let after = ApkContainer::open(&fs::read(&out_path).unwrap()).unwrap();
    assert_eq!(after.read_entry("classes.dex").unwrap(), &before.bytes[..]);
}

#[test]
fn crack_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);
    let once = dir.path().join("once.apk");
    let twice = dir.path().join("twice.apk");

    let pipeline = CrackPipeline::new(&NoopSigner, &NoopSigner);
    assert!(pipeline.run(&apk_path, &once, &[BypassCategory::Root]).success);
    let second = pipeline.run(&once, &twice, &[BypassCategory::Root]);

    // The second pass rewrites the already-forced method to the same bytes.
    assert!(second.success);
    assert_eq!(second.applied_fixes.len(), 1);
    assert_eq!(fs::read(&once).unwrap(), fs::read(&twice).unwrap());
}

#[test]
fn corrupt_dex_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let dex = build_security_dex();
    let mut broken = dex.bytes.clone();
    broken[0] = b'X'; // wreck the magic
    let apk = build_security_apk(&broken);
    let apk_path = dir.path().join("broken.apk");
    fs::write(&apk_path, &apk).unwrap();
    let out_path = dir.path().join("out.apk");

    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &out_path, &[BypassCategory::Root]);
    assert!(!outcome.success);
    assert!(outcome.applied_fixes.is_empty());
    assert!(outcome.error.as_deref().unwrap().contains("classes.dex"));
    assert!(!out_path.exists());
}

#[test]
fn missing_dex_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let apk = {
        use std::io::Write;
        use zip::write::{FileOptions, ZipWriter};
        let mut writer = ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer.start_file("AndroidManifest.xml", FileOptions::default()).unwrap();
        writer.write_all(b"<manifest/>").unwrap();
        writer.finish().unwrap().into_inner()
    };
    let apk_path = dir.path().join("nodex.apk");
    fs::write(&apk_path, &apk).unwrap();

    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &dir.path().join("out.apk"), &[BypassCategory::Root]);
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("no .dex entries"));
}

#[test]
fn dex_entries_are_found_at_any_path() {
    let dir = tempfile::tempdir().unwrap();
    let dex = build_security_dex();
    let apk = build_apk_with_dex("assets/code/bundle.dex", &dex.bytes);
    let apk_path = dir.path().join("bundled.apk");
    fs::write(&apk_path, &apk).unwrap();
    let out_path = dir.path().join("out.apk");

    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &out_path, &[BypassCategory::Premium]);
    assert!(outcome.success, "run failed: {:?}", outcome.error);
    assert_eq!(outcome.applied_fixes.len(), 1);
    assert_eq!(outcome.modified_entries, vec!["assets/code/bundle.dex".to_string()]);

    let cracked = ApkContainer::open(&fs::read(&out_path).unwrap()).unwrap();
    verify_seal(cracked.read_entry("assets/code/bundle.dex").unwrap()).unwrap();
}

#[test]
fn signing_failure_keeps_partial_fixes() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);
    let out_path = dir.path().join("out.apk");

    let outcome = CrackPipeline::new(&BrokenSigner, &BrokenSigner)
        .run(&apk_path, &out_path, &[BypassCategory::Root]);
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("broken"));
    // The rewrite happened before signing and must still be reported.
    assert_eq!(outcome.applied_fixes.len(), 1);
    assert!(!out_path.exists());
}

#[test]
fn cancellation_stops_before_patching() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);
    let out_path = dir.path().join("out.apk");

    let token = CancelToken::new();
    token.cancel();
    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .with_cancel(token)
        .run(&apk_path, &out_path, &[BypassCategory::Root]);
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("operation cancelled"));
    assert!(!out_path.exists());
}

#[test]
fn patch_bare_dex_forces_premium_true() {
    let dir = tempfile::tempdir().unwrap();
    let dex = build_security_dex();
    let in_path = dir.path().join("classes.dex");
    let out_path = dir.path().join("classes-patched.dex");
    fs::write(&in_path, &dex.bytes).unwrap();

    let outcome = patch_dex_file(&in_path, &out_path, &[BypassCategory::Premium]).unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.applied_fixes.len(), 1);
    assert_eq!(outcome.applied_fixes[0].method, format!("{}->isPremium()Z", CLASS_DESC));

    let patched = fs::read(&out_path).unwrap();
    verify_seal(&patched).unwrap();
    let off = dex.code_offs[1] as usize;
    assert_eq!(read_u32_at(&patched, off + 12), 2);
    assert_eq!(read_u16_at(&patched, off + 16), 0x1012); // const/4 v0, #1
    assert_eq!(read_u16_at(&patched, off + 18), 0x000F); // return v0
}

#[test]
fn empty_category_list_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let (apk_path, _, _) = write_fixture_apk(&dir);
    let outcome = CrackPipeline::new(&NoopSigner, &NoopSigner)
        .run(&apk_path, &dir.path().join("out.apk"), &[]);
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("no bypass categories"));
}
