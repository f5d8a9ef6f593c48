//! Error types for IPSW archive inspection and extraction.
//!
//! Every failure mode of the pipeline maps to one variant here, carrying
//! enough context (entry name, identity, path) to diagnose without a
//! debugger. The CLI derives its exit status from [`Error::exit_code`],
//! so scripting callers can branch on the failure category.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for IPSW operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== Archive Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt archive '{path}': {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("archive entry not found: {name}")]
    EntryNotFound { name: String },

    // ==================== Manifest Errors ====================
    #[error("malformed build manifest: {reason}")]
    MalformedManifest { reason: String },

    // ==================== Identity Selection Errors ====================
    #[error("no build identity matches {}", selector_desc(.device_class, .board_config))]
    NoMatchingIdentity {
        device_class: Option<String>,
        board_config: Option<String>,
    },

    #[error(
        "{matches} build identities match {}; specify both a device class and a board config",
        selector_desc(.device_class, .board_config)
    )]
    AmbiguousIdentity {
        device_class: Option<String>,
        board_config: Option<String>,
        matches: usize,
    },

    #[error("build identity '{device_class}' has no '{component}' component")]
    MissingComponent {
        component: String,
        device_class: String,
    },

    // ==================== Image Decoding Errors ====================
    #[error("unsupported image format in '{entry}': {reason}")]
    UnsupportedFormat { entry: String, reason: String },

    #[error("failed to decode '{entry}': {reason}")]
    DecodeFailure { entry: String, reason: String },

    #[error("checksum mismatch for '{entry}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("image entry path escapes the output root: {name}")]
    PathTraversal { name: String },

    // ==================== Output Errors ====================
    #[error("insufficient space writing '{path}'")]
    InsufficientSpace { path: PathBuf },

    #[error("failed to write '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    // ==================== Cancellation ====================
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for IPSW operations.
pub type Result<T> = std::result::Result<T, Error>;

fn selector_desc(device_class: &Option<String>, board_config: &Option<String>) -> String {
    match (device_class, board_config) {
        (Some(d), Some(b)) => format!("device class '{d}' and board config '{b}'"),
        (Some(d), None) => format!("device class '{d}'"),
        (None, Some(b)) => format!("board config '{b}'"),
        (None, None) => "an unselected archive with multiple identities".to_string(),
    }
}

impl Error {
    /// Creates a malformed-manifest error with a formatted reason.
    #[inline]
    pub fn manifest(reason: impl Into<String>) -> Self {
        Error::MalformedManifest {
            reason: reason.into(),
        }
    }

    /// Creates a decode failure for the given archive entry.
    #[inline]
    pub fn decode(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DecodeFailure {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unsupported-format error for the given archive entry.
    #[inline]
    pub fn unsupported(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedFormat {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a write-side I/O error, detecting exhausted disk space.
    pub fn write_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::StorageFull || source.raw_os_error() == Some(28) {
            Error::InsufficientSpace { path }
        } else {
            Error::FileWrite { path, source }
        }
    }

    /// Returns true when the failure happened while decoding image content,
    /// as opposed to selection, output I/O, or cancellation.
    ///
    /// Used to decide whether a stored-payload digest mismatch should take
    /// precedence: corrupt input explains a decoder error.
    #[inline]
    pub fn is_decode_class(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedFormat { .. } | Error::DecodeFailure { .. }
        )
    }

    /// Returns the stable process exit code for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::FileOpen { .. } | Error::FileWrite { .. } | Error::Io(_) => 1,
            Error::CorruptArchive { .. } | Error::EntryNotFound { .. } => 2,
            Error::MalformedManifest { .. } => 3,
            Error::NoMatchingIdentity { .. } => 4,
            Error::AmbiguousIdentity { .. } => 5,
            Error::MissingComponent { .. } => 6,
            Error::UnsupportedFormat { .. } => 7,
            Error::DecodeFailure { .. } => 8,
            Error::ChecksumMismatch { .. } => 9,
            Error::InsufficientSpace { .. } => 10,
            Error::Cancelled => 11,
            Error::PathTraversal { .. } => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_descriptions() {
        let err = Error::NoMatchingIdentity {
            device_class: Some("iPhone11,8".into()),
            board_config: None,
        };
        assert!(err.to_string().contains("device class 'iPhone11,8'"));

        let err = Error::AmbiguousIdentity {
            device_class: None,
            board_config: Some("n841ap".into()),
            matches: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 build identities"));
        assert!(msg.contains("board config 'n841ap'"));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let errors = [
            Error::Io(io::Error::other("x")),
            Error::CorruptArchive {
                path: PathBuf::from("a.ipsw"),
                reason: "bad".into(),
            },
            Error::manifest("missing key"),
            Error::NoMatchingIdentity {
                device_class: None,
                board_config: None,
            },
            Error::AmbiguousIdentity {
                device_class: None,
                board_config: None,
                matches: 2,
            },
            Error::MissingComponent {
                component: "OS".into(),
                device_class: "iPhone11,8".into(),
            },
            Error::unsupported("a.dmg", "unknown magic"),
            Error::decode("a.dmg", "truncated"),
            Error::ChecksumMismatch {
                entry: "a.dmg".into(),
                expected: "00".into(),
                actual: "ff".into(),
            },
            Error::InsufficientSpace {
                path: PathBuf::from("/out"),
            },
            Error::Cancelled,
            Error::PathTraversal {
                name: "../evil".into(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_write_failed_maps_enospc() {
        let enospc = io::Error::from_raw_os_error(28);
        assert!(matches!(
            Error::write_failed("/out/file", enospc),
            Error::InsufficientSpace { .. }
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            Error::write_failed("/out/file", denied),
            Error::FileWrite { .. }
        ));
    }
}
