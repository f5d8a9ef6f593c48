//! Read-only archive summaries.
//!
//! Pure projection of the parsed manifest and restore descriptor; no
//! archive payload is touched. The summary renders for humans via
//! `Display` and for tooling via `serde`.

use std::fmt;

use serde::Serialize;

use crate::manifest::{BuildManifest, RestoreInfo};

/// Summary of an IPSW's metadata.
#[derive(Debug, Clone, Serialize)]
pub struct IpswSummary {
    /// OS version, from the restore descriptor
    pub product_version: String,
    /// Build version, from the restore descriptor
    pub product_build_version: String,
    /// Product types the bundle supports
    pub supported_product_types: Vec<String>,
    /// One entry per packaged build identity
    pub identities: Vec<IdentitySummary>,
}

/// Summary of one build identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    /// Device class identifier
    pub device_class: String,
    /// Board configuration identifier
    pub board_config: String,
    /// Build variant description, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Restore behavior, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore_behavior: Option<String>,
    /// Component keys the identity carries, sorted
    pub components: Vec<String>,
}

/// Builds the summary for a parsed manifest and restore descriptor.
pub fn summarize(manifest: &BuildManifest, restore: &RestoreInfo) -> IpswSummary {
    IpswSummary {
        product_version: restore.product_version.clone(),
        product_build_version: restore.product_build_version.clone(),
        supported_product_types: manifest.supported_product_types.clone(),
        identities: manifest
            .identities
            .iter()
            .map(|identity| IdentitySummary {
                device_class: identity.device_class.clone(),
                board_config: identity.board_config.clone(),
                variant: identity.variant.clone(),
                restore_behavior: identity.restore_behavior.clone(),
                components: identity.component_names().map(str::to_string).collect(),
            })
            .collect(),
    }
}

impl fmt::Display for IpswSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "SupportedProductTypes: {}",
            self.supported_product_types.join(", ")
        )?;
        writeln!(f, "ProductVersion: {}", self.product_version)?;
        writeln!(f, "ProductBuildVersion: {}", self.product_build_version)?;
        writeln!(f, "BuildIdentities:")?;
        for identity in &self.identities {
            write!(f, "- {} / {}", identity.device_class, identity.board_config)?;
            if let Some(variant) = &identity.variant {
                write!(f, " [{variant}]")?;
            }
            if let Some(behavior) = &identity.restore_behavior {
                write!(f, " ({behavior})")?;
            }
            writeln!(f)?;
            writeln!(f, "  components: {}", identity.components.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::manifest::testutil::{identity_value, manifest_bytes, manifest_value, os_component};

    fn fixture() -> (BuildManifest, RestoreInfo) {
        let manifest = BuildManifest::parse(&manifest_bytes(&manifest_value(vec![
            identity_value(
                "deviceX",
                "boardA",
                vec![
                    ("OS", os_component("os_a.dmg")),
                    ("KernelCache", os_component("kc_a.im4p")),
                ],
            ),
            identity_value("deviceY", "boardB", vec![("OS", os_component("os_b.dmg"))]),
        ])))
        .unwrap();
        let restore = RestoreInfo {
            product_version: "16.0".into(),
            product_build_version: "20A362".into(),
            supported_product_types: vec!["iPhone15,2".into()],
        };
        (manifest, restore)
    }

    #[test]
    fn test_summary_round_trips_fixture_fields() {
        let (manifest, restore) = fixture();
        let summary = summarize(&manifest, &restore);

        assert_eq!(summary.product_version, "16.0");
        assert_eq!(summary.product_build_version, "20A362");
        assert_eq!(summary.supported_product_types, vec!["iPhone15,2"]);
        assert_eq!(summary.identities.len(), 2);
        assert_eq!(summary.identities[0].device_class, "deviceX");
        assert_eq!(
            summary.identities[0].components,
            vec!["KernelCache", "OS"]
        );
        assert_eq!(summary.identities[1].board_config, "boardB");
    }

    #[test]
    fn test_display_lists_identities() {
        let (manifest, restore) = fixture();
        let text = summarize(&manifest, &restore).to_string();
        assert!(text.contains("ProductVersion: 16.0"));
        assert!(text.contains("deviceX / boardA"));
        assert!(text.contains("components: KernelCache, OS"));
    }

    #[test]
    fn test_json_serialization() {
        let (manifest, restore) = fixture();
        let json = serde_json::to_value(summarize(&manifest, &restore)).unwrap();
        assert_eq!(json["product_build_version"], "20A362");
        assert_eq!(json["identities"][1]["device_class"], "deviceY");
        // Absent options stay out of the serialized form entirely.
        assert!(json["identities"][0].get("variant").is_none());
    }
}
