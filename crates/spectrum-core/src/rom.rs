//! ROM image loading.
//!
//! A model needs 1, 2 or 4 ROM banks. They can arrive as one merged
//! image, or as a base file plus companion files named `<stem>-N.rom` or
//! `<stem>_N.rom`. Merged images are sanity-checked against the known
//! 48K BASIC and 128K menu signatures and reordered when the user
//! supplied them back to front.

use std::path::Path;

const BANK_SIZE: usize = 0x4000;

/// Load `banks_expected` ROM banks starting from `path`.
///
/// # Errors
///
/// Missing files, sizes that are not bank multiples, or not enough
/// companion files.
pub fn load_rom_banks(path: &Path, banks_expected: usize) -> Result<Vec<Vec<u8>>, String> {
    let data = std::fs::read(path)
        .map_err(|e| format!("cannot read ROM {}: {e}", path.display()))?;

    if data.len() == banks_expected * BANK_SIZE {
        let mut banks: Vec<Vec<u8>> = data.chunks(BANK_SIZE).map(<[u8]>::to_vec).collect();
        reorder_merged(&mut banks);
        return Ok(banks);
    }

    if data.len() == BANK_SIZE && banks_expected > 1 {
        // Single bank on disk: look for companions.
        let mut banks = vec![data];
        for n in 1..banks_expected {
            banks.push(read_companion(path, n)?);
        }
        return Ok(banks);
    }

    Err(format!(
        "ROM {} is {} bytes; expected {} (merged) or {BANK_SIZE} plus companion files",
        path.display(),
        data.len(),
        banks_expected * BANK_SIZE
    ))
}

/// Find `<stem>-N.rom` or `<stem>_N.rom` next to the base file.
fn read_companion(path: &Path, n: usize) -> Result<Vec<u8>, String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| format!("ROM path {} has no stem", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for sep in ['-', '_'] {
        let candidate = dir.join(format!("{stem}{sep}{n}.rom"));
        if candidate.exists() {
            let data = std::fs::read(&candidate)
                .map_err(|e| format!("cannot read ROM {}: {e}", candidate.display()))?;
            if data.len() != BANK_SIZE {
                return Err(format!(
                    "companion ROM {} is {} bytes, expected {BANK_SIZE}",
                    candidate.display(),
                    data.len()
                ));
            }
            return Ok(data);
        }
    }
    Err(format!(
        "missing companion ROM bank {n} for {}",
        path.display()
    ))
}

/// Fix up a merged multi-bank image the user saved in the wrong order:
/// the 128K menu ROM must come first and 48K BASIC last.
fn reorder_merged(banks: &mut [Vec<u8>]) {
    if banks.len() < 2 {
        return;
    }
    let menu = banks.iter().position(|b| looks_like_128k_menu(b));
    let basic = banks.iter().position(|b| looks_like_48k_basic(b));

    if let (Some(menu), Some(basic)) = (menu, basic)
        && menu > basic
    {
        log::info!(
            "merged ROM image looks reversed (menu in bank {menu}, BASIC in bank {basic}); reordering"
        );
        banks.swap(menu, basic);
    }
}

/// 48K BASIC carries its copyright strings.
fn looks_like_48k_basic(bank: &[u8]) -> bool {
    contains(bank, b"1982") && contains(bank, b"Sinclair Research")
}

/// The 128-family editor/menu ROM.
fn looks_like_128k_menu(bank: &[u8]) -> bool {
    contains(bank, b"128")
        && [
            b"128K".as_slice(),
            b"1986",
            b"1985",
            b"AMSTRAD",
            b"MENU",
        ]
        .iter()
        .any(|needle| contains(bank, needle))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("spectrum-core-rom-{}-{name}", std::process::id()));
        p
    }

    fn bank_with(signatures: &[&[u8]]) -> Vec<u8> {
        let mut bank = vec![0u8; BANK_SIZE];
        let mut offset = 0x100;
        for sig in signatures {
            bank[offset..offset + sig.len()].copy_from_slice(sig);
            offset += 0x100;
        }
        bank
    }

    #[test]
    fn signature_detection() {
        let basic = bank_with(&[b"1982", b"Sinclair Research"]);
        assert!(looks_like_48k_basic(&basic));
        assert!(!looks_like_128k_menu(&basic));

        let menu = bank_with(&[b"128", b"1986"]);
        assert!(looks_like_128k_menu(&menu));
        assert!(!looks_like_48k_basic(&menu));
    }

    #[test]
    fn merged_image_loads_in_order() {
        let path = scratch("merged.rom");
        let menu = bank_with(&[b"128", b"MENU"]);
        let basic = bank_with(&[b"1982", b"Sinclair Research"]);
        let mut merged = menu.clone();
        merged.extend_from_slice(&basic);
        std::fs::write(&path, &merged).expect("write");

        let banks = load_rom_banks(&path, 2).expect("load");
        assert_eq!(banks.len(), 2);
        assert!(looks_like_128k_menu(&banks[0]));
        assert!(looks_like_48k_basic(&banks[1]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reversed_merged_image_is_reordered() {
        let path = scratch("reversed.rom");
        let menu = bank_with(&[b"128", b"MENU"]);
        let basic = bank_with(&[b"1982", b"Sinclair Research"]);
        let mut merged = basic.clone();
        merged.extend_from_slice(&menu);
        std::fs::write(&path, &merged).expect("write");

        let banks = load_rom_banks(&path, 2).expect("load");
        assert!(looks_like_128k_menu(&banks[0]), "menu moved to bank 0");
        assert!(looks_like_48k_basic(&banks[1]));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn companion_files_dash_and_underscore() {
        let base = scratch("multi.rom");
        let dir = base.parent().expect("dir").to_path_buf();
        let stem = base.file_stem().and_then(|s| s.to_str()).expect("stem");

        std::fs::write(&base, vec![0u8; BANK_SIZE]).expect("write base");
        let dash = dir.join(format!("{stem}-1.rom"));
        std::fs::write(&dash, vec![1u8; BANK_SIZE]).expect("write dash");

        let banks = load_rom_banks(&base, 2).expect("load");
        assert_eq!(banks[1][0], 1);

        let _ = std::fs::remove_file(&base);
        let _ = std::fs::remove_file(&dash);
    }

    #[test]
    fn missing_companion_is_an_error() {
        let base = scratch("lonely.rom");
        std::fs::write(&base, vec![0u8; BANK_SIZE]).expect("write base");
        let err = load_rom_banks(&base, 2).expect_err("no companion");
        assert!(err.contains("companion"));
        let _ = std::fs::remove_file(&base);
    }

    #[test]
    fn bad_size_is_an_error() {
        let path = scratch("short.rom");
        std::fs::write(&path, vec![0u8; 100]).expect("write");
        assert!(load_rom_banks(&path, 1).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
