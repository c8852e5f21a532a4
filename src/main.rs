use dexpatch::{analyze, crack_apk, patch_dex_file, BypassCategory};
use std::env;
use std::path::Path;
use std::process::exit;

fn usage() -> ! {
    eprintln!("Usage: dexpatch <command> [args]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  analyze <apk>                        list bypass candidates per category");
    eprintln!("  crack <apk> <categories> [output]    patch, repackage and re-sign an APK");
    eprintln!("  patch <dex> <categories> [output]    patch a bare .dex file (no signing)");
    eprintln!();
    eprintln!("Categories: login, iap, root, cert, debug, premium, all");
    eprintln!("(comma-separated, e.g. root,cert)");
    exit(1);
}

fn parse_categories(arg: &str) -> Vec<BypassCategory> {
    if arg.eq_ignore_ascii_case("all") {
        return BypassCategory::ALL.to_vec();
    }
    let mut out = vec![];
    for part in arg.split(',') {
        match BypassCategory::parse(part.trim()) {
            Some(c) => out.push(c),
            None => {
                eprintln!("Unknown category '{}'", part.trim());
                usage();
            }
        }
    }
    out
}

fn derive_output(input: &str, suffix: &str) -> String {
    match input.rsplit_once('.') {
        Some((stem, ext)) => format!("{}-{}.{}", stem, suffix, ext),
        None => format!("{}-{}", input, suffix),
    }
}

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let result = match args[1].as_str() {
        "analyze" => analyze(Path::new(&args[2]))
            .map_err(|e| e.to_string())
            .and_then(|report| {
                let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
                println!("{}", json);
                Ok(())
            }),
        "crack" => {
            if args.len() < 4 {
                usage();
            }
            let categories = parse_categories(&args[3]);
            let output = args.get(4).cloned().unwrap_or_else(|| derive_output(&args[2], "cracked"));
            let outcome = crack_apk(Path::new(&args[2]), Path::new(&output), &categories);
            for fix in &outcome.applied_fixes {
                println!("[{}] {}", fix.category, fix.method);
            }
            for failure in &outcome.failures {
                eprintln!("skipped: {}", failure);
            }
            if outcome.success {
                println!(
                    "{} fixes applied, signed with {}, written to {}",
                    outcome.applied_fixes.len(),
                    outcome.signed_with.as_deref().unwrap_or("nothing"),
                    output
                );
            }
            match outcome.error {
                Some(msg) => Err(msg),
                None => Ok(()),
            }
        }
        "patch" => {
            if args.len() < 4 {
                usage();
            }
            let categories = parse_categories(&args[3]);
            let output = args.get(4).cloned().unwrap_or_else(|| derive_output(&args[2], "patched"));
            patch_dex_file(Path::new(&args[2]), Path::new(&output), &categories)
                .map_err(|e| e.to_string())
                .map(|outcome| {
                    for fix in &outcome.applied_fixes {
                        println!("[{}] {}", fix.category, fix.method);
                    }
                    println!("{} fixes applied, written to {}", outcome.applied_fixes.len(), output);
                })
        }
        _ => usage(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        exit(1);
    }
}
