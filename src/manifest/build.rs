//! Typed build manifest records.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;

use plist::{Dictionary, Value};
use tracing::warn;

use crate::error::{Error, Result};

// =============================================================================
// Build Manifest
// =============================================================================

/// A parsed build manifest.
///
/// Immutable once parsed. Unknown top-level keys are preserved in
/// [`BuildManifest::extra`] rather than dropped.
#[derive(Debug, Clone)]
pub struct BuildManifest {
    /// OS version string, e.g. "16.0"
    pub product_version: String,
    /// Build version string, e.g. "20A362"
    pub product_build_version: String,
    /// Product types this bundle supports, e.g. ["iPhone15,2"]
    pub supported_product_types: Vec<String>,
    /// One identity per packaged device/board variant; never empty
    pub identities: Vec<BuildIdentity>,
    /// Top-level keys the parser does not interpret
    pub extra: Dictionary,
}

impl BuildManifest {
    /// Parses a build manifest from property-list bytes (XML or binary).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(bytes))
            .map_err(|e| Error::manifest(format!("not a property list: {e}")))?;
        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| Error::manifest("top level is not a dictionary"))?;

        let product_version = take_string(&mut dict, "ProductVersion")?;
        let product_build_version = take_string(&mut dict, "ProductBuildVersion")?;
        let supported_product_types = take_string_array(&mut dict, "SupportedProductTypes")?;

        let raw_identities = dict
            .remove("BuildIdentities")
            .ok_or_else(|| Error::manifest("missing required key 'BuildIdentities'"))?
            .into_array()
            .ok_or_else(|| Error::manifest("'BuildIdentities' is not an array"))?;
        if raw_identities.is_empty() {
            return Err(Error::manifest("'BuildIdentities' is empty"));
        }

        let mut identities = Vec::with_capacity(raw_identities.len());
        for (i, value) in raw_identities.into_iter().enumerate() {
            match BuildIdentity::from_value(value) {
                Ok(identity) => identities.push(identity),
                Err(e) => warn!("skipping build identity {i}: {e}"),
            }
        }
        if identities.is_empty() {
            return Err(Error::manifest(
                "no build identity carries the required device class and board config",
            ));
        }

        Ok(Self {
            product_version,
            product_build_version,
            supported_product_types,
            identities,
            extra: dict,
        })
    }
}

// =============================================================================
// Build Identity
// =============================================================================

/// One device/board variant's component mapping within a build manifest.
#[derive(Debug, Clone)]
pub struct BuildIdentity {
    /// Device class identifier, e.g. "iPhone11,8"
    pub device_class: String,
    /// Board configuration identifier, e.g. "n841ap"
    pub board_config: String,
    /// Build variant description, when present
    pub variant: Option<String>,
    /// Restore behavior ("Erase", "Update"), when present
    pub restore_behavior: Option<String>,
    /// Component name to reference mapping, sorted by name
    pub components: BTreeMap<String, ComponentRef>,
    /// Uninterpreted keys from the identity's Info dictionary
    pub extra: Dictionary,
}

impl BuildIdentity {
    fn from_value(value: Value) -> Result<Self> {
        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| Error::manifest("identity is not a dictionary"))?;

        let mut info = dict
            .remove("Info")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| Error::manifest("identity has no 'Info' dictionary"))?;

        let device_class = take_string(&mut info, "DeviceClass")?;
        let board_config = take_string(&mut info, "BoardConfig")?;
        let variant = take_opt_string(&mut info, "Variant")?;
        let restore_behavior = take_opt_string(&mut info, "RestoreBehavior")?;

        let manifest = dict
            .remove("Manifest")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| {
                Error::manifest(format!("identity '{device_class}' has no 'Manifest' dictionary"))
            })?;

        let mut components = BTreeMap::new();
        for (name, value) in manifest {
            let component = ComponentRef::from_value(&name, value)?;
            components.insert(name, component);
        }

        Ok(Self {
            device_class,
            board_config,
            variant,
            restore_behavior,
            components,
            extra: info,
        })
    }

    /// Looks up a component reference by name.
    pub fn component(&self, name: &str) -> Option<&ComponentRef> {
        self.components.get(name)
    }

    /// Returns true if the identity carries the named component.
    pub fn has_component(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// Returns the component names, sorted.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }
}

// =============================================================================
// Component Reference
// =============================================================================

/// A component's reference into the archive: entry path plus the
/// decode parameters the manifest declares for it.
#[derive(Debug, Clone)]
pub struct ComponentRef {
    /// Component name, e.g. "OS"
    pub name: String,
    /// Archive entry path holding the component payload
    pub path: String,
    /// Expected SHA-256 of the stored payload, when declared
    pub digest: Option<Vec<u8>>,
    /// Declared image format string ("raw", "block", "aea"), when present
    pub format: Option<String>,
    /// Decryption material for encrypted containers
    pub encryption: Option<EncryptionKeys>,
}

impl ComponentRef {
    fn from_value(name: &str, value: Value) -> Result<Self> {
        let mut dict = value
            .into_dictionary()
            .ok_or_else(|| Error::manifest(format!("component '{name}' is not a dictionary")))?;

        let digest = match dict.remove("Digest") {
            Some(v) => Some(v.into_data().ok_or_else(|| {
                Error::manifest(format!("component '{name}' digest is not a data blob"))
            })?),
            None => None,
        };

        let mut info = dict
            .remove("Info")
            .and_then(Value::into_dictionary)
            .ok_or_else(|| Error::manifest(format!("component '{name}' has no 'Info' dictionary")))?;

        let path = take_string(&mut info, "Path")
            .map_err(|_| Error::manifest(format!("component '{name}' has no 'Path'")))?;
        let format = take_opt_string(&mut info, "ImageFormat")?;

        let key = take_opt_data(&mut info, "EncryptionKey")?;
        let iv = take_opt_data(&mut info, "EncryptionIV")?;
        let encryption = match (key, iv) {
            (Some(key), Some(iv)) => Some(EncryptionKeys::new(name, &key, &iv)?),
            (None, None) => None,
            _ => {
                return Err(Error::manifest(format!(
                    "component '{name}' declares an encryption key without an IV (or vice versa)"
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            path,
            digest,
            format,
            encryption,
        })
    }
}

/// AES-256-CTR material for an encrypted image container.
#[derive(Clone)]
pub struct EncryptionKeys {
    /// 256-bit key
    pub key: [u8; 32],
    /// 128-bit initial counter block
    pub iv: [u8; 16],
}

impl EncryptionKeys {
    fn new(component: &str, key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key.try_into().map_err(|_| {
            Error::manifest(format!("component '{component}' EncryptionKey must be 32 bytes"))
        })?;
        let iv: [u8; 16] = iv.try_into().map_err(|_| {
            Error::manifest(format!("component '{component}' EncryptionIV must be 16 bytes"))
        })?;
        Ok(Self { key, iv })
    }
}

// Key material stays out of logs and error chains.
impl fmt::Debug for EncryptionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKeys { .. }")
    }
}

// =============================================================================
// Dictionary Helpers
// =============================================================================

fn take_string(dict: &mut Dictionary, key: &str) -> Result<String> {
    match dict.remove(key) {
        Some(v) => v
            .into_string()
            .ok_or_else(|| Error::manifest(format!("'{key}' is not a string"))),
        None => Err(Error::manifest(format!("missing required key '{key}'"))),
    }
}

fn take_opt_string(dict: &mut Dictionary, key: &str) -> Result<Option<String>> {
    match dict.remove(key) {
        Some(v) => v
            .into_string()
            .map(Some)
            .ok_or_else(|| Error::manifest(format!("'{key}' is not a string"))),
        None => Ok(None),
    }
}

fn take_opt_data(dict: &mut Dictionary, key: &str) -> Result<Option<Vec<u8>>> {
    match dict.remove(key) {
        Some(v) => v
            .into_data()
            .map(Some)
            .ok_or_else(|| Error::manifest(format!("'{key}' is not a data blob"))),
        None => Ok(None),
    }
}

fn take_string_array(dict: &mut Dictionary, key: &str) -> Result<Vec<String>> {
    let array = match dict.remove(key) {
        Some(v) => v
            .into_array()
            .ok_or_else(|| Error::manifest(format!("'{key}' is not an array")))?,
        None => return Err(Error::manifest(format!("missing required key '{key}'"))),
    };
    array
        .into_iter()
        .map(|v| {
            v.into_string()
                .ok_or_else(|| Error::manifest(format!("'{key}' contains a non-string element")))
        })
        .collect()
}
