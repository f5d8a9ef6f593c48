//! Restore descriptor records.

use std::io::Cursor;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Archive entry name of the restore descriptor.
pub const RESTORE_ENTRY: &str = "Restore.plist";

/// Metadata from the restore descriptor.
///
/// Decoded tolerantly: fields beyond the three below are ignored, so
/// descriptor growth in newer bundles does not break parsing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestoreInfo {
    /// OS version string, e.g. "16.0"
    pub product_version: String,
    /// Build version string, e.g. "20A362"
    pub product_build_version: String,
    /// Supported product types, e.g. ["iPhone15,2"]
    #[serde(default)]
    pub supported_product_types: Vec<String>,
}

impl RestoreInfo {
    /// Parses a restore descriptor from property-list bytes (XML or binary).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        plist::from_reader(Cursor::new(bytes))
            .map_err(|e| Error::manifest(format!("restore descriptor: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use plist::{Dictionary, Value};

    fn restore_value() -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert("ProductVersion".into(), Value::String("16.0".into()));
        dict.insert("ProductBuildVersion".into(), Value::String("20A362".into()));
        dict.insert(
            "SupportedProductTypes".into(),
            Value::Array(vec![
                Value::String("iPhone15,2".into()),
                Value::String("iPhone15,3".into()),
            ]),
        );
        dict
    }

    fn to_bytes(dict: Dictionary) -> Vec<u8> {
        let mut buf = Vec::new();
        Value::Dictionary(dict).to_writer_xml(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_parse() {
        let info = RestoreInfo::parse(&to_bytes(restore_value())).unwrap();
        assert_eq!(info.product_version, "16.0");
        assert_eq!(info.product_build_version, "20A362");
        assert_eq!(
            info.supported_product_types,
            vec!["iPhone15,2", "iPhone15,3"]
        );
    }

    #[test]
    fn test_extra_fields_tolerated() {
        let mut dict = restore_value();
        dict.insert(
            "DeviceMap".into(),
            Value::Array(vec![Value::String("opaque".into())]),
        );
        assert!(RestoreInfo::parse(&to_bytes(dict)).is_ok());
    }

    #[test]
    fn test_missing_version_rejected() {
        let mut dict = restore_value();
        dict.remove("ProductVersion");
        assert!(matches!(
            RestoreInfo::parse(&to_bytes(dict)),
            Err(Error::MalformedManifest { .. })
        ));
    }
}
