//! SHA-256 checksum files.

use ciwi_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Parse `sha256sum`-style lines (`<hex>  <name>` or `<hex> *<name>`).
/// Lines that do not have exactly two fields are ignored.
pub fn parse_checksums(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let digest = fields.next()?;
            let name = fields.next()?;
            if fields.next().is_some() {
                return None;
            }
            let name = name.strip_prefix('*').unwrap_or(name);
            Some((name.to_string(), digest.to_ascii_lowercase()))
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn verify(asset: &str, data: &[u8], checksums: &str) -> Result<String> {
    let expected = parse_checksums(checksums)
        .remove(asset)
        .ok_or_else(|| Error::Upstream(format!("checksum for {asset} not found")))?;
    let actual = sha256_hex(data);
    if actual != expected {
        return Err(Error::ChecksumMismatch {
            asset: asset.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_parse_checksums() {
        let text = format!(
            "{HELLO_SHA}  ciwi-linux-amd64\n{HELLO_SHA} *ciwi-windows-amd64.exe\nbogus line with extra fields\n\n"
        );
        let parsed = parse_checksums(&text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["ciwi-linux-amd64"], HELLO_SHA);
        assert!(parsed.contains_key("ciwi-windows-amd64.exe"));
    }

    #[test]
    fn test_verify() {
        let text = format!("{HELLO_SHA}  ciwi-linux-amd64\n");
        assert_eq!(verify("ciwi-linux-amd64", b"hello", &text).unwrap(), HELLO_SHA);
        assert!(matches!(
            verify("ciwi-linux-amd64", b"tampered", &text),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(verify("ciwi-darwin-arm64", b"hello", &text).is_err());
    }
}
