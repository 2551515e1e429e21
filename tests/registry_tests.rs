//! Tests for the registry client's pure parts: reference parsing and the
//! wire types. Protocol behaviour against live registries is exercised by
//! the pull path itself.

use podder::error::Error;
use podder::registry::{layer_compression, ImageReference, LayerCompression};

// =============================================================================
// Reference Parsing
// =============================================================================

#[test]
fn test_docker_hub_style_references() {
    let parsed = ImageReference::parse("registry-1.docker.io/library/ubuntu:latest").unwrap();
    assert_eq!(parsed.registry, "registry-1.docker.io");
    assert_eq!(parsed.repository, "library/ubuntu");
    assert_eq!(parsed.reference, "latest");
    assert_eq!(parsed.short_name(), "ubuntu");
    assert_eq!(
        parsed.to_string(),
        "registry-1.docker.io/library/ubuntu:latest"
    );
}

#[test]
fn test_ghcr_style_references() {
    let parsed = ImageReference::parse("ghcr.io/home-assistant/home-assistant:stable").unwrap();
    assert_eq!(parsed.registry, "ghcr.io");
    assert_eq!(parsed.short_name(), "home-assistant");
}

#[test]
fn test_single_component_repositories() {
    let parsed = ImageReference::parse("registry.fedoraproject.org/fedora:40").unwrap();
    assert_eq!(parsed.repository, "fedora");
    assert_eq!(parsed.reference, "40");
}

#[test]
fn test_digest_references() {
    let raw = format!("quay.io/org/app@sha256:{}", "ab".repeat(32));
    let parsed = ImageReference::parse(&raw).unwrap();
    assert!(parsed.reference.starts_with("sha256:"));
    assert_eq!(parsed.to_string(), raw);
}

#[test]
fn test_invalid_references_are_rejected() {
    for raw in [
        "ubuntu",               // no registry
        "reg.io/",              // empty repository
        "reg.io/repo@md5:abcd", // unsupported digest algorithm
        "reg.io/re po:x",       // whitespace
    ] {
        assert!(
            matches!(
                ImageReference::parse(raw),
                Err(Error::InvalidReference { .. }) | Err(Error::UnsupportedMediaType(_))
            ),
            "{} should not parse",
            raw
        );
    }
}

// =============================================================================
// Media Types
// =============================================================================

#[test]
fn test_both_oci_and_docker_layer_types_are_accepted() {
    for (media_type, expected) in [
        (
            "application/vnd.oci.image.layer.v1.tar",
            LayerCompression::None,
        ),
        (
            "application/vnd.docker.image.rootfs.diff.tar",
            LayerCompression::None,
        ),
        (
            "application/vnd.oci.image.layer.v1.tar+gzip",
            LayerCompression::Gzip,
        ),
        (
            "application/vnd.docker.image.rootfs.diff.tar.gzip",
            LayerCompression::Gzip,
        ),
        (
            "application/vnd.oci.image.layer.v1.tar+zstd",
            LayerCompression::Zstd,
        ),
    ] {
        assert_eq!(layer_compression(media_type).unwrap(), expected);
    }
}

#[test]
fn test_foreign_layers_are_unsupported() {
    assert!(matches!(
        layer_compression("application/vnd.docker.image.rootfs.foreign.diff.tar.gzip"),
        Err(Error::UnsupportedMediaType(_))
    ));
}
