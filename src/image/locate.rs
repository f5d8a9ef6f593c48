//! Resolving build identity components to concrete image references.

use crate::error::{Error, Result};
use crate::manifest::{BuildIdentity, ComponentRef, EncryptionKeys};

/// Component key of the root filesystem image.
pub const ROOT_FILESYSTEM_COMPONENT: &str = "OS";
/// Component key of the system cryptex image.
pub const SYSTEM_CRYPTEX_COMPONENT: &str = "Cryptex1,SystemOS";
/// Component key of the app cryptex image.
pub const APP_CRYPTEX_COMPONENT: &str = "Cryptex1,AppOS";

// =============================================================================
// Image Format
// =============================================================================

/// On-disk packaging of a filesystem image entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Plain tree container, no transcoding needed
    Raw,
    /// Zlib block-compressed image
    BlockCompressed,
    /// Encrypted container wrapping a raw or block-compressed image
    EncryptedContainer,
}

impl ImageFormat {
    /// Parses a declared format string from component metadata.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Some(ImageFormat::Raw),
            "block" | "block-compressed" => Some(ImageFormat::BlockCompressed),
            "aea" | "encrypted" => Some(ImageFormat::EncryptedContainer),
            _ => None,
        }
    }
}

// =============================================================================
// Filesystem Image Reference
// =============================================================================

/// A resolved reference to the archive entry holding a filesystem image.
#[derive(Debug, Clone)]
pub struct FilesystemImageRef {
    /// Component name the reference came from
    pub component: String,
    /// Archive entry path of the image payload
    pub entry_path: String,
    /// Declared packaging of the payload
    pub format: ImageFormat,
    /// Decryption material, for encrypted containers
    pub encryption: Option<EncryptionKeys>,
    /// Expected SHA-256 of the stored payload, when declared
    pub digest: Option<Vec<u8>>,
}

/// Resolves the identity's root filesystem component.
pub fn locate_root_filesystem(identity: &BuildIdentity) -> Result<FilesystemImageRef> {
    locate_component_image(identity, ROOT_FILESYSTEM_COMPONENT)
}

/// Resolves an arbitrary image-bearing component of the identity.
pub fn locate_component_image(
    identity: &BuildIdentity,
    component: &str,
) -> Result<FilesystemImageRef> {
    let component_ref = identity
        .component(component)
        .ok_or_else(|| Error::MissingComponent {
            component: component.to_string(),
            device_class: identity.device_class.clone(),
        })?;
    image_ref(component_ref)
}

fn image_ref(component: &ComponentRef) -> Result<FilesystemImageRef> {
    let format = match &component.format {
        Some(declared) => ImageFormat::parse(declared).ok_or_else(|| {
            Error::unsupported(
                component.path.clone(),
                format!("unknown image format '{declared}'"),
            )
        })?,
        // Undeclared: the presence of key material implies the container.
        None if component.encryption.is_some() => ImageFormat::EncryptedContainer,
        None => ImageFormat::Raw,
    };

    if format == ImageFormat::EncryptedContainer && component.encryption.is_none() {
        return Err(Error::manifest(format!(
            "component '{}' is declared encrypted but carries no key material",
            component.name
        )));
    }

    Ok(FilesystemImageRef {
        component: component.name.clone(),
        entry_path: component.path.clone(),
        format,
        encryption: component.encryption.clone(),
        digest: component.digest.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::manifest::BuildManifest;
    use crate::manifest::testutil::{identity_value, manifest_bytes, manifest_value, os_component};

    use plist::Value;

    fn parsed_identity(components: Vec<(&str, Value)>) -> BuildIdentity {
        let bytes = manifest_bytes(&manifest_value(vec![identity_value(
            "deviceX", "boardA", components,
        )]));
        BuildManifest::parse(&bytes).unwrap().identities.remove(0)
    }

    #[test]
    fn test_locate_root_filesystem() {
        let identity = parsed_identity(vec![("OS", os_component("os.dmg"))]);
        let image = locate_root_filesystem(&identity).unwrap();
        assert_eq!(image.component, "OS");
        assert_eq!(image.entry_path, "os.dmg");
        assert_eq!(image.format, ImageFormat::Raw);
    }

    #[test]
    fn test_missing_component_names_identity() {
        let identity = parsed_identity(vec![("KernelCache", os_component("kc.im4p"))]);
        let err = locate_root_filesystem(&identity).unwrap_err();
        match err {
            Error::MissingComponent {
                component,
                device_class,
            } => {
                assert_eq!(component, "OS");
                assert_eq!(device_class, "deviceX");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_declared_format_wins() {
        let mut component = os_component("os.dmg");
        component
            .as_dictionary_mut()
            .unwrap()
            .get_mut("Info")
            .unwrap()
            .as_dictionary_mut()
            .unwrap()
            .insert("ImageFormat".into(), Value::String("block".into()));
        let identity = parsed_identity(vec![("OS", component)]);
        assert_eq!(
            locate_root_filesystem(&identity).unwrap().format,
            ImageFormat::BlockCompressed
        );
    }

    #[test]
    fn test_keys_imply_encrypted_container() {
        let mut component = os_component("os.aea");
        {
            let info = component
                .as_dictionary_mut()
                .unwrap()
                .get_mut("Info")
                .unwrap()
                .as_dictionary_mut()
                .unwrap();
            info.insert("EncryptionKey".into(), Value::Data(vec![0x11; 32]));
            info.insert("EncryptionIV".into(), Value::Data(vec![0x22; 16]));
        }
        let identity = parsed_identity(vec![("OS", component)]);
        let image = locate_root_filesystem(&identity).unwrap();
        assert_eq!(image.format, ImageFormat::EncryptedContainer);
        assert!(image.encryption.is_some());
    }

    #[test]
    fn test_unknown_format_string() {
        let mut component = os_component("os.dmg");
        component
            .as_dictionary_mut()
            .unwrap()
            .get_mut("Info")
            .unwrap()
            .as_dictionary_mut()
            .unwrap()
            .insert("ImageFormat".into(), Value::String("lzfse".into()));
        let identity = parsed_identity(vec![("OS", component)]);
        assert!(matches!(
            locate_root_filesystem(&identity),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_encrypted_declared_without_keys() {
        let mut component = os_component("os.aea");
        component
            .as_dictionary_mut()
            .unwrap()
            .get_mut("Info")
            .unwrap()
            .as_dictionary_mut()
            .unwrap()
            .insert("ImageFormat".into(), Value::String("aea".into()));
        let identity = parsed_identity(vec![("OS", component)]);
        assert!(matches!(
            locate_root_filesystem(&identity),
            Err(Error::MalformedManifest { .. })
        ));
    }
}
