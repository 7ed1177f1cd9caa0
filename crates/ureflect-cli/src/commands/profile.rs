//! `ureflect profile`: Validate a layout profile and summarise it.

use std::fmt::Write as _;
use std::path::Path;

use ureflect_engine::layout::{BoolLayout, TableLayout};
use ureflect_engine::LayoutProfile;

use super::load_profile;

pub fn execute(file: &Path, native: bool, dump: bool) -> anyhow::Result<()> {
    let profile = load_profile(file)?;
    if native {
        profile.check_native()?;
    }

    if dump {
        print!("{}", profile.to_toml()?);
    } else {
        print!("{}", summarize(&profile));
    }
    Ok(())
}

fn table(table: &TableLayout) -> String {
    let storage = match table.chunk_size {
        Some(chunk) => format!("chunked ({} per chunk)", chunk),
        None => "flat".to_string(),
    };
    format!(
        "{}, stride {:#x}, count at {:#x}",
        storage, table.stride, table.count_offset
    )
}

/// Human-readable overview of a profile
pub fn summarize(profile: &LayoutProfile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Profile:      {}", profile.name);
    let _ = writeln!(
        out,
        "Target:       {}-bit, {:?} calling convention",
        profile.pointer_width * 8,
        profile.calling_convention
    );
    let _ = writeln!(out, "Names:        {}", table(&profile.names.table));
    let _ = writeln!(out, "Objects:      {}", table(&profile.objects.table));
    let _ = writeln!(
        out,
        "Object:       class {:#x}, name {:#x}, outer {:#x}",
        profile.object.class, profile.object.name, profile.object.outer
    );
    let _ = writeln!(
        out,
        "Struct:       super {:#x}, children {:#x}, size {:#x}",
        profile.structure.super_struct,
        profile.structure.children,
        profile.structure.properties_size
    );
    let bools = match profile.property.bool {
        BoolLayout::Byte { .. } => "byte mask",
        BoolLayout::Word { .. } => "word mask",
    };
    let _ = writeln!(
        out,
        "Property:     offset {:#x}, flags {:#x}, bools by {}",
        profile.property.offset, profile.property.property_flags, bools
    );
    let _ = writeln!(
        out,
        "Strings:      {}-byte characters",
        profile.strings.char_width
    );
    match &profile.allocator {
        Some(slots) => {
            let _ = writeln!(
                out,
                "Allocator:    vtable slots {}/{}/{}",
                slots.malloc, slots.realloc, slots.free
            );
        }
        None => {
            let _ = writeln!(out, "Allocator:    libc");
        }
    }

    if profile.patterns.is_empty() {
        let _ = writeln!(out, "Patterns:     none");
    } else {
        let _ = writeln!(out, "Patterns:     {}", profile.patterns.len());
        for (name, spec) in &profile.patterns {
            let capture = match &spec.capture {
                Some(c) if c.relative => format!(" -> rel32 @ {:+}", c.offset),
                Some(c) => format!(" -> u{} @ {:+}", c.width * 8, c.offset),
                None => String::new(),
            };
            let _ = writeln!(out, "  {:<12} {}{}", name, spec.pattern, capture);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = include_str!("../../profiles/sample.toml");

    #[test]
    fn test_sample_profile_summary() {
        let profile = LayoutProfile::from_str(SAMPLE).unwrap();
        let summary = summarize(&profile);
        assert!(summary.contains("Profile:      sample-ue4-win64"));
        assert!(summary.contains("64-bit"));
        assert!(summary.contains("chunked (65536 per chunk)"));
        assert!(summary.contains("GObjects"));
        assert!(summary.contains("rel32"));
    }

    #[test]
    fn test_execute_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        execute(file.path(), false, false).unwrap();
        execute(file.path(), false, true).unwrap();
    }

    #[test]
    fn test_invalid_profile_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let broken = SAMPLE.replace("pointer_width = 8", "pointer_width = 6");
        file.write_all(broken.as_bytes()).unwrap();

        let err = execute(file.path(), false, false).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("failed to load layout profile"));
        assert!(message.contains("pointer width"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(execute(&dir.path().join("absent.toml"), false, false).is_err());
    }
}
