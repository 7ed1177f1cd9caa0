//! `ureflect scan`: Run a profile's patterns against a module image.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use ureflect_engine::scan::resolve_patterns;
use ureflect_engine::LayoutProfile;

use super::load_profile;

pub fn execute(profile: &Path, image: &Path, base: usize, only: Option<&str>) -> anyhow::Result<()> {
    let profile = load_profile(profile)?;
    let bytes = std::fs::read(image)
        .with_context(|| format!("failed to read image {}", image.display()))?;
    log::info!(
        "scanning {} bytes of {} at {:#x}",
        bytes.len(),
        image.display(),
        base
    );

    let results = run(&profile, &bytes, base, only)?;
    let width = results.keys().map(|name| name.len()).max().unwrap_or(0);
    for (name, found) in &results {
        match found {
            Some(addr) => println!("{:<width$}  {:#x}", name, addr, width = width),
            None => println!("{:<width$}  not found", name, width = width),
        }
    }

    let missing = results.values().filter(|found| found.is_none()).count();
    if missing > 0 {
        bail!("{} of {} patterns did not resolve", missing, results.len());
    }
    Ok(())
}

/// Resolve the profile's patterns (or just `only`) in `image` mapped at `base`
pub fn run(
    profile: &LayoutProfile,
    image: &[u8],
    base: usize,
    only: Option<&str>,
) -> anyhow::Result<BTreeMap<String, Option<usize>>> {
    let specs = match only {
        Some(name) => {
            let Some(spec) = profile.patterns.get(name) else {
                bail!("profile '{}' has no pattern named '{}'", profile.name, name);
            };
            BTreeMap::from([(name.to_string(), spec.clone())])
        }
        None => profile.patterns.clone(),
    };
    if specs.is_empty() {
        bail!("profile '{}' defines no patterns", profile.name);
    }
    Ok(resolve_patterns(image, base, &specs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = include_str!("../../profiles/sample.toml");
    const BASE: usize = 0x1_4000_0000;

    /// Image with the `GObjects` instruction at 0x100 referencing 0x2000
    fn image() -> Vec<u8> {
        let mut image = vec![0xCCu8; 0x400];
        let at = 0x100;
        let code = [0x48, 0x8B, 0x05, 0, 0, 0, 0, 0x48, 0x8B, 0x0C, 0xC8, 0x48, 0x8D, 0x04, 0xD1];
        image[at..at + code.len()].copy_from_slice(&code);
        // rip-relative: target = field + 4 + disp
        let disp = (0x2000 - (at + 3 + 4)) as i32;
        image[at + 3..at + 7].copy_from_slice(&disp.to_le_bytes());
        image
    }

    #[test]
    fn test_run_resolves_relative_capture() {
        let profile = LayoutProfile::from_str(SAMPLE).unwrap();
        let results = run(&profile, &image(), BASE, None).unwrap();

        assert_eq!(results["GObjects"], Some(BASE + 0x2000));
        assert_eq!(results["GNames"], None);
        assert_eq!(results.len(), profile.patterns.len());
    }

    #[test]
    fn test_run_single_pattern() {
        let profile = LayoutProfile::from_str(SAMPLE).unwrap();
        let results = run(&profile, &image(), BASE, Some("GObjects")).unwrap();
        assert_eq!(results.len(), 1);

        let err = run(&profile, &image(), BASE, Some("GWorld")).unwrap_err();
        assert!(err.to_string().contains("no pattern named 'GWorld'"));
    }

    #[test]
    fn test_execute_reports_missing_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let profile_path = dir.path().join("profile.toml");
        let image_path = dir.path().join("module.bin");
        std::fs::write(&profile_path, SAMPLE).unwrap();
        let mut file = std::fs::File::create(&image_path).unwrap();
        file.write_all(&image()).unwrap();

        execute(&profile_path, &image_path, BASE, Some("GObjects")).unwrap();
        let err = execute(&profile_path, &image_path, BASE, None).unwrap_err();
        assert!(err.to_string().contains("did not resolve"));
        assert!(execute(&profile_path, &dir.path().join("absent.bin"), BASE, None).is_err());
    }
}
