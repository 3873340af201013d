//! Platform selection out of a manifest list/index: exact match first, then
//! an arm/arm64 variant-compatibility fallback, matching how a newer
//! `arm64/v8` host can still run an image only published for `arm64` (no
//! variant) or `arm/v7`.

use crate::manifest::{Descriptor, Platform};

/// Variant compatibility, most to least specific, for each architecture
/// that actually has variants in practice. An entry not listed here has no
/// variant fallback: an exact (architecture, variant) match or nothing.
fn variant_fallbacks(architecture: &str, variant: Option<&str>) -> Vec<Option<String>> {
    match (architecture, variant) {
        ("arm64", Some("v8")) => vec![Some("v8".to_string()), None],
        ("arm64", None) => vec![None],
        ("arm", Some("v7")) => vec![Some("v7".to_string()), Some("v6".to_string()), None],
        ("arm", Some("v6")) => vec![Some("v6".to_string()), None],
        ("arm", None) => vec![None],
        (_, Some(v)) => vec![Some(v.to_string())],
        (_, None) => vec![None],
    }
}

/// Pick the best instance descriptor in `instances` for `want`. Exact
/// (os, architecture, variant, os_version) match wins; failing that, try
/// each entry in the architecture's variant-compatibility list in order.
pub fn select(instances: &[Descriptor], want: &Platform) -> Option<Descriptor> {
    for (d, p) in instances.iter().filter_map(|d| d.platform.as_ref().map(|p| (d, p))) {
        if p.os == want.os && p.architecture == want.architecture && p.variant == want.variant {
            return Some(d.clone());
        }
    }

    for candidate_variant in variant_fallbacks(&want.architecture, want.variant.as_deref()) {
        for (d, p) in instances.iter().filter_map(|d| d.platform.as_ref().map(|p| (d, p))) {
            if p.os == want.os && p.architecture == want.architecture && p.variant == candidate_variant {
                return Some(d.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Algorithm, Digest};

    fn platform(os: &str, arch: &str, variant: Option<&str>) -> Platform {
        Platform {
            architecture: arch.to_string(),
            os: os.to_string(),
            os_version: None,
            os_features: vec![],
            variant: variant.map(|v| v.to_string()),
        }
    }

    fn instance(platform: Platform) -> Descriptor {
        let mut d = Descriptor::new(
            crate::manifest::MT_OCI1_MANIFEST,
            1,
            Digest::of_bytes(Algorithm::Sha256, platform.architecture.as_bytes()),
        );
        d.platform = Some(platform);
        d
    }

    #[test]
    fn exact_match_wins() {
        let instances = vec![instance(platform("linux", "amd64", None)), instance(platform("linux", "arm64", Some("v8")))];
        let want = platform("linux", "arm64", Some("v8"));
        let chosen = select(&instances, &want).unwrap();
        assert_eq!(chosen.platform.unwrap().architecture, "arm64");
    }

    #[test]
    fn arm64_v8_falls_back_to_variantless_arm64() {
        let instances = vec![instance(platform("linux", "arm64", None))];
        let want = platform("linux", "arm64", Some("v8"));
        assert!(select(&instances, &want).is_some());
    }

    #[test]
    fn arm_v7_falls_back_to_v6_then_variantless() {
        let instances = vec![instance(platform("linux", "arm", Some("v6")))];
        let want = platform("linux", "arm", Some("v7"));
        assert!(select(&instances, &want).is_some());
    }

    #[test]
    fn no_matching_platform_returns_none() {
        let instances = vec![instance(platform("linux", "amd64", None))];
        let want = platform("linux", "s390x", None);
        assert!(select(&instances, &want).is_none());
    }
}
