use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use url::Url;

use crate::error::StoreError;

/// Parsed location of the remote object store (`s3://bucket/prefix`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUri {
    pub bucket: String,
    /// Key prefix without leading or trailing separators; may be empty
    pub prefix: String,
}

impl StorageUri {
    /// Parse a URI string into a StorageUri
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| anyhow!("Invalid storage URI {}: {}", uri, e))?;

        match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| anyhow!("Storage URI missing bucket: {}", uri))?
                    .to_string();

                let prefix = url.path().trim_matches('/').to_string();

                Ok(StorageUri { bucket, prefix })
            }
            scheme => Err(anyhow!("Unsupported storage URI scheme: {}", scheme)),
        }
    }

    /// Append a key segment to the prefix
    pub fn scoped(mut self, segment: &str) -> Self {
        self.prefix = join_key(&self.prefix, segment);
        self
    }

    /// Full key for a logical key relative to this location
    pub fn full_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    /// Logical key for a full key listed from this location
    pub fn logical_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(self.prefix.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(full_key)
    }
}

/// Join two key fragments with exactly one separator
pub fn join_key(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, name),
    }
}

/// Listing prefix for everything stored under a named folder
pub fn folder_prefix(name: &str) -> String {
    format!("{}/", name.trim_matches('/'))
}

/// Keys ending in a separator are folder placeholders, not data
pub fn is_directory_marker(key: &str) -> bool {
    key.ends_with('/')
}

/// Reject keys the remote store would interpret ambiguously
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let reason = if key.trim().is_empty() {
        Some("key cannot be empty")
    } else if key.contains("..") || key.contains("//") {
        Some("key contains unsafe characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Map a key listed under `prefix` onto a path below `dest_dir`
///
/// Returns `None` for keys outside the prefix, directory markers and any key
/// whose relative part would escape `dest_dir`.
pub fn mirror_path(dest_dir: &Path, prefix: &str, key: &str) -> Option<PathBuf> {
    let relative = key.strip_prefix(prefix)?.trim_start_matches('/');
    if relative.is_empty() || is_directory_marker(relative) {
        return None;
    }

    let mut path = dest_dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

/// Content type used for uploads, derived from the file extension
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("xlsx") | Some("xls") => {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        }
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_uri() {
        let uri = StorageUri::parse("s3://my-bucket/path/to/data/").unwrap();
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.prefix, "path/to/data");
    }

    #[test]
    fn test_parse_storage_uri_without_prefix() {
        let uri = StorageUri::parse("s3://bucket").unwrap();
        assert_eq!(uri.bucket, "bucket");
        assert_eq!(uri.prefix, "");
        assert_eq!(uri.full_key("grades/a.csv"), "grades/a.csv");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(StorageUri::parse("gs://bucket/x").is_err());
        assert!(StorageUri::parse("/local/path").is_err());
        assert!(StorageUri::parse("s3:///missing-bucket").is_err());
    }

    #[test]
    fn test_scoped_keys_round_trip() {
        let uri = StorageUri::parse("s3://bucket/base").unwrap().scoped("prod");
        assert_eq!(uri.prefix, "base/prod");

        let full = uri.full_key("grades/2024.csv");
        assert_eq!(full, "base/prod/grades/2024.csv");
        assert_eq!(uri.logical_key(&full), "grades/2024.csv");
    }

    #[test]
    fn test_directory_markers() {
        assert!(is_directory_marker("grades/"));
        assert!(is_directory_marker("grades/2024/"));
        assert!(!is_directory_marker("grades/2024.csv"));
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("records/a.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("records/../secrets").is_err());
        assert!(validate_key("records//a.json").is_err());
    }

    #[test]
    fn test_mirror_path_keeps_nested_layout() {
        let dest = Path::new("/tmp/in/grades");
        assert_eq!(
            mirror_path(dest, "grades/", "grades/2024/fall.csv"),
            Some(PathBuf::from("/tmp/in/grades/2024/fall.csv"))
        );
        assert_eq!(
            mirror_path(dest, "grades/", "grades/spring.csv"),
            Some(PathBuf::from("/tmp/in/grades/spring.csv"))
        );
    }

    #[test]
    fn test_mirror_path_rejects_markers_and_escapes() {
        let dest = Path::new("/tmp/in/grades");
        assert_eq!(mirror_path(dest, "grades/", "grades/"), None);
        assert_eq!(mirror_path(dest, "grades/", "grades/2024/"), None);
        assert_eq!(mirror_path(dest, "grades/", "grades/../../etc/passwd"), None);
        assert_eq!(mirror_path(dest, "grades/", "coursebook/a.json"), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.CSV")), "text/csv");
        assert_eq!(content_type_for(Path::new("b.json")), "application/json");
        assert_eq!(
            content_type_for(Path::new("c.xls")),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
        assert_eq!(
            content_type_for(Path::new("noext")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("a/", "/b"), "a/b");
        assert_eq!(join_key("", "b"), "b");
        assert_eq!(join_key("a", ""), "a");
        assert_eq!(folder_prefix("grades"), "grades/");
    }
}
