//! Build identity selection.
//!
//! Pure functions over the parsed manifest. Selecting the wrong identity
//! would silently extract the wrong hardware variant's filesystem, so
//! every ambiguous case is an error: there is no "first identity wins"
//! fallback anywhere in this module.

use crate::error::{Error, Result};
use crate::manifest::{BuildIdentity, BuildManifest};

/// Selects the build identity matching the given device class and/or
/// board config.
///
/// Matching is case-insensitive and exact. With no selectors, the
/// manifest must contain exactly one identity; with selectors, exactly
/// one identity must survive the filter. Zero survivors fail with
/// [`Error::NoMatchingIdentity`], several with [`Error::AmbiguousIdentity`].
pub fn resolve<'m>(
    manifest: &'m BuildManifest,
    device_class: Option<&str>,
    board_config: Option<&str>,
) -> Result<&'m BuildIdentity> {
    if device_class.is_none() && board_config.is_none() {
        return match manifest.identities.as_slice() {
            [only] => Ok(only),
            identities => Err(Error::AmbiguousIdentity {
                device_class: None,
                board_config: None,
                matches: identities.len(),
            }),
        };
    }

    let matches: Vec<&BuildIdentity> = manifest
        .identities
        .iter()
        .filter(|identity| {
            device_class.is_none_or(|d| identity.device_class.eq_ignore_ascii_case(d))
                && board_config.is_none_or(|b| identity.board_config.eq_ignore_ascii_case(b))
        })
        .collect();

    match matches.as_slice() {
        [] => Err(Error::NoMatchingIdentity {
            device_class: device_class.map(str::to_string),
            board_config: board_config.map(str::to_string),
        }),
        [identity] => Ok(identity),
        several => Err(Error::AmbiguousIdentity {
            device_class: device_class.map(str::to_string),
            board_config: board_config.map(str::to_string),
            matches: several.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use plist::Dictionary;

    fn identity(device_class: &str, board_config: &str) -> BuildIdentity {
        BuildIdentity {
            device_class: device_class.to_string(),
            board_config: board_config.to_string(),
            variant: None,
            restore_behavior: None,
            components: BTreeMap::new(),
            extra: Dictionary::new(),
        }
    }

    fn manifest(identities: Vec<BuildIdentity>) -> BuildManifest {
        BuildManifest {
            product_version: "16.0".into(),
            product_build_version: "20A362".into(),
            supported_product_types: vec!["iPhone15,2".into()],
            identities,
            extra: Dictionary::new(),
        }
    }

    #[test]
    fn test_single_identity_no_selectors() {
        let m = manifest(vec![identity("deviceX", "boardA")]);
        assert_eq!(resolve(&m, None, None).unwrap().device_class, "deviceX");
    }

    #[test]
    fn test_multiple_identities_no_selectors_is_ambiguous() {
        let m = manifest(vec![
            identity("deviceX", "boardA"),
            identity("deviceY", "boardB"),
        ]);
        assert!(matches!(
            resolve(&m, None, None),
            Err(Error::AmbiguousIdentity { matches: 2, .. })
        ));
    }

    #[test]
    fn test_board_config_selector() {
        let m = manifest(vec![
            identity("deviceX", "boardA"),
            identity("deviceY", "boardB"),
        ]);
        assert_eq!(
            resolve(&m, None, Some("boardB")).unwrap().device_class,
            "deviceY"
        );
    }

    #[test]
    fn test_selectors_are_case_insensitive() {
        let m = manifest(vec![
            identity("deviceX", "boardA"),
            identity("deviceY", "boardB"),
        ]);
        assert_eq!(
            resolve(&m, Some("DEVICEY"), None).unwrap().board_config,
            "boardB"
        );
    }

    #[test]
    fn test_both_selectors_must_match_same_identity() {
        let m = manifest(vec![
            identity("deviceX", "boardA"),
            identity("deviceY", "boardB"),
        ]);
        assert!(resolve(&m, Some("deviceY"), Some("boardB")).is_ok());
        assert!(matches!(
            resolve(&m, Some("deviceY"), Some("boardA")),
            Err(Error::NoMatchingIdentity { .. })
        ));
    }

    #[test]
    fn test_no_match() {
        let m = manifest(vec![identity("deviceX", "boardA")]);
        assert!(matches!(
            resolve(&m, None, Some("boardZ")),
            Err(Error::NoMatchingIdentity { .. })
        ));
    }

    #[test]
    fn test_duplicate_matches_are_ambiguous() {
        let m = manifest(vec![
            identity("deviceX", "boardA"),
            identity("deviceX", "boardA"),
        ]);
        assert!(matches!(
            resolve(&m, Some("deviceX"), None),
            Err(Error::AmbiguousIdentity { matches: 2, .. })
        ));
    }
}
