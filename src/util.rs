use std::path::Path;

use rand_core::{OsRng, RngCore};

use crate::error::VmError;

/// Parse a human-readable size string into bytes.
///
/// Accepts formats like `"20G"`, `"512M"`, `"100K"`, `"1073741824"`.
/// Uses binary units (1G = 1024³ = 1,073,741,824 bytes).
pub fn parse_size(s: &str) -> Result<u64, VmError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(VmError::Validation {
            message: "size cannot be empty".into(),
        });
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
        None => (s, String::new()),
    };

    let num: u64 = num_str.parse().map_err(|_| VmError::Validation {
        message: format!("invalid size number: '{num_str}'"),
    })?;

    let multiplier: u64 = match suffix.as_str() {
        "" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(VmError::Validation {
                message: format!("unknown size suffix: '{suffix}' (use G, M, K, or T)"),
            });
        }
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| VmError::Validation {
            message: format!("size overflows: '{s}'"),
        })
}

/// Locally-administered MAC in QEMU's `52:54:00` range.
pub fn generate_mac() -> String {
    let mut tail = [0u8; 3];
    OsRng.fill_bytes(&mut tail);
    format!("52:54:00:{:02x}:{:02x}:{:02x}", tail[0], tail[1], tail[2])
}

/// Random alphanumeric string for one-time guest passwords.
pub fn random_password(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

/// Quote a single argument for `sh -c`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Write `contents` to `path` via a sibling temp file and an atomic rename,
/// so concurrent readers never observe a partial file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), VmError> {
    let tmp = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => {
            return Err(VmError::Validation {
                message: format!("not a file path: {}", path.display()),
            });
        }
    };
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| VmError::io(format!("writing {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        VmError::io(
            format!("renaming {} to {}", tmp.display(), path.display()),
            e,
        )
    })?;
    Ok(())
}

/// Last `n` lines of a text file; empty when the file is missing.
pub fn tail_lines(path: &Path, n: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
