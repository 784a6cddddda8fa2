use std::path::Path;
use sha2::{Digest, Sha256};

/// Extracts the file extension from a filename and converts it to lowercase.
pub fn get_file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

/// Calculates SHA-256 checksum of the given data slice.
pub fn calculate_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Reduces a client-supplied name to a string safe for use inside a storage key.
///
/// Keeps ASCII alphanumerics, `.`, `-` and `_`, turns whitespace into `_`,
/// drops everything else (path separators included) and strips leading dots
/// and underscores so the result can never be `..` or a hidden file.
pub fn secure_filename(name: &str) -> String {
    let mapped: String = name
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                Some(c)
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .collect();

    let trimmed = mapped.trim_start_matches(['.', '_']).trim_end_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(get_file_extension("Photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(get_file_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(get_file_extension("noext"), None);
    }

    #[test]
    fn secure_filename_strips_traversal() {
        assert_eq!(secure_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(secure_filename("my report (final).pdf"), "my_report_final.pdf");
        assert_eq!(secure_filename(".hidden"), "hidden");
        assert_eq!(secure_filename("///"), "file");
    }

    #[test]
    fn sha256_is_hex() {
        assert_eq!(
            calculate_sha256(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
