//! Translating a fetched image into a chain of layers.
//!
//! A manifest with layers `[B0 … Bn]` becomes exactly n+1 store layers,
//! bottom-up: `B0 … B(n−1)` are named by their digest hex, the top layer
//! takes the short name derived from the reference and carries the image
//! configuration in its `config.ini`. Digest-named layers that already
//! exist are reused, which makes a re-pull of unchanged content a
//! filesystem no-op.
//!
//! Downloading is asynchronous and may fetch blobs in parallel; extraction
//! is strictly sequential bottom-up (each layer's parent edge must exist
//! first) and happens in a forked, user-namespaced staging child so that
//! archive-embedded ownership lands without host privilege.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::extract_layer;
use crate::idmap::IdMaps;
use crate::registry::{
    layer_compression, parse_digest, ImageConfig, ImageReference, LayerCompression,
    RegistryClient,
};
use crate::store::LayerStore;
use crate::userns;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// A blob downloaded and ready for extraction.
#[derive(Debug, Clone)]
struct PlannedLayer {
    /// Store layer name (digest hex, or the short name for the top).
    name: String,
    /// Name of the layer below, if any.
    parent: Option<String>,
    /// Blob to extract; `None` means the layer already exists and is reused.
    blob: Option<(PathBuf, LayerCompression, String)>,
}

/// Everything `import` needs, produced by `fetch`.
#[derive(Debug)]
pub struct FetchedImage {
    reference: ImageReference,
    manifest_digest: String,
    config: ImageConfig,
    plan: Vec<PlannedLayer>,
}

/// Result of a completed pull.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Name of the chain's top layer.
    pub top_layer: String,
    /// Layers newly created by this pull.
    pub created: usize,
    /// Layers reused from a previous pull.
    pub reused: usize,
}

/// Imports registry images into a layer store.
pub struct Importer<'a> {
    store: &'a LayerStore,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a LayerStore) -> Self {
        Self { store }
    }

    /// Pulls an image: fetch on a private single-threaded runtime, then
    /// extract in a user-namespaced staging child.
    ///
    /// The runtime is dropped before the fork, keeping the process
    /// single-threaded while children are spawned.
    pub fn pull_blocking(
        &self,
        client: &RegistryClient,
        reference: &ImageReference,
    ) -> Result<PullOutcome> {
        let fetched = {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(self.fetch(client, reference))?
        };
        match fetched {
            Some(image) => self.import(image),
            None => {
                let top = reference.short_name().to_string();
                info!(layer = %top, "image already up to date");
                let reused = self.store.chain(&top)?.len();
                Ok(PullOutcome {
                    top_layer: top,
                    created: 0,
                    reused,
                })
            }
        }
    }

    /// Resolves the manifest and downloads missing blobs into the cache.
    ///
    /// Returns `None` when the store already holds the full chain for this
    /// manifest. Blob downloads for distinct layers run concurrently.
    pub async fn fetch(
        &self,
        client: &RegistryClient,
        reference: &ImageReference,
    ) -> Result<Option<FetchedImage>> {
        let resolved = client.resolve_manifest(reference).await?;
        let manifest = &resolved.manifest;
        let top_name = reference.short_name().to_string();

        let mut plan = Vec::with_capacity(manifest.layers.len());
        let mut previous: Option<String> = None;
        for (index, descriptor) in manifest.layers.iter().enumerate() {
            let is_top = index == manifest.layers.len() - 1;
            let name = if is_top {
                top_name.clone()
            } else {
                parse_digest(&descriptor.digest)?.to_string()
            };
            // Digest-named layers are content-addressed and safe to reuse;
            // the top layer is only current if it records this manifest.
            let reusable = if is_top {
                self.top_layer_matches(&name, &resolved.digest)?
            } else {
                self.store.contains(&name)
            };
            plan.push(PlannedLayer {
                parent: previous.replace(name.clone()),
                blob: if reusable {
                    None
                } else {
                    let compression = layer_compression(&descriptor.media_type)?;
                    Some((PathBuf::new(), compression, descriptor.digest.clone()))
                },
                name,
            });
        }

        if plan.iter().all(|layer| layer.blob.is_none()) {
            return Ok(None);
        }

        let config = client.fetch_config(reference, &manifest.config).await?;

        let cache = self.store.blob_cache_dir();
        fs::create_dir_all(&cache)?;
        let downloads = manifest
            .layers
            .iter()
            .zip(plan.iter())
            .filter(|(_, planned)| planned.blob.is_some())
            .map(|(descriptor, _)| client.download_blob(reference, descriptor, &cache));
        let paths = futures_util::future::try_join_all(downloads).await?;

        let mut paths = paths.into_iter();
        for planned in plan.iter_mut() {
            if let Some((path, _, _)) = planned.blob.as_mut() {
                *path = paths.next().expect("one download per planned blob");
            }
        }

        Ok(Some(FetchedImage {
            reference: reference.clone(),
            manifest_digest: resolved.digest,
            config,
            plan,
        }))
    }

    /// Extracts fetched blobs into the store, bottom-up, inside a mapped
    /// user namespace. Blobs are removed from the cache afterwards.
    pub fn import(&self, image: FetchedImage) -> Result<PullOutcome> {
        let maps = IdMaps::for_invoking_user()?;
        let id_span = maps.uid_span().max(1);
        let created = image.plan.iter().filter(|l| l.blob.is_some()).count();
        let reused = image.plan.len() - created;
        let top_layer = image.plan.last().expect("manifest has layers").name.clone();
        let top_config = self.image_config_ini(&image);

        let store = self.store.clone();
        let label = image.reference.to_string();
        let plan = image.plan;
        let blobs: Vec<PathBuf> = plan
            .iter()
            .filter_map(|planned| planned.blob.as_ref().map(|(path, _, _)| path.clone()))
            .collect();
        userns::run_mapped(&maps, &label, move || {
            for (index, planned) in plan.iter().enumerate() {
                let is_top = index == plan.len() - 1;
                let Some((blob, compression, digest)) = &planned.blob else {
                    debug!(layer = %planned.name, "reusing existing layer");
                    continue;
                };
                info!(layer = %planned.name, digest = %digest, "extracting layer");

                let layer = if store.contains(&planned.name) {
                    // A stale top layer from an earlier pull of this tag:
                    // re-point its parent and drop the superseded contents.
                    store.set_parent(&planned.name, planned.parent.as_deref())?;
                    let layer = store.resolve(&planned.name)?;
                    fs::remove_dir_all(layer.root_dir())?;
                    layer
                } else {
                    store.create(&planned.name, planned.parent.as_deref(), None)?
                };
                layer.ensure_dirs()?;
                extract_layer(blob, *compression, &layer.root_dir(), id_span).map_err(
                    |err| match err {
                        Error::PathTraversal { .. } => err,
                        other => Error::Extraction {
                            digest: digest.clone(),
                            reason: other.to_string(),
                        },
                    },
                )?;
                if is_top {
                    top_config.save(&layer.config_path())?;
                }
            }
            // Top layer was fully reused except for its config? Then the
            // plan rewrote nothing; make sure the config is still current.
            if plan.last().map_or(false, |l| l.blob.is_none()) {
                let layer = store.resolve(&plan.last().unwrap().name)?;
                top_config.save(&layer.config_path())?;
            }
            Ok(())
        })?;

        // The staging child cannot unlink from the user-owned cache.
        for blob in blobs {
            let _ = fs::remove_file(blob);
        }

        info!(
            top = %top_layer,
            created,
            reused,
            "image imported"
        );
        Ok(PullOutcome {
            top_layer,
            created,
            reused,
        })
    }

    /// Builds the top layer's `config.ini` from the image config.
    fn image_config_ini(&self, image: &FetchedImage) -> Config {
        let mut config = Config::new();

        let runtime = image.config.config.clone().unwrap_or_default();
        let mut command: Vec<String> = Vec::new();
        command.extend(runtime.entrypoint.unwrap_or_default());
        command.extend(runtime.cmd.unwrap_or_default());
        if !command.is_empty() {
            config.set("container", "command", shell_words::join(&command));
        }
        for entry in runtime.env.unwrap_or_default() {
            config.push("container", "env", entry);
        }
        if let Some(workdir) = runtime.working_dir {
            if !workdir.is_empty() {
                config.set("container", "workdir", workdir);
            }
        }

        config.set("storage", "ephemeral", "true");
        config.set("image", "reference", image.reference.to_string());
        config.set("image", "digest", image.manifest_digest.clone());
        config
    }

    fn top_layer_matches(&self, name: &str, manifest_digest: &str) -> Result<bool> {
        if !self.store.contains(name) {
            return Ok(false);
        }
        let recorded = self
            .store
            .resolve(name)?
            .load_config()?
            .get("image", "digest")
            .map(str::to_string);
        Ok(recorded.as_deref() == Some(manifest_digest))
    }
}

/// Resolves a `pull` argument: a full reference, or the name of an existing
/// layer whose `[image] reference` records where it came from.
pub fn resolve_pull_target(store: &LayerStore, target: &str) -> Result<ImageReference> {
    if !target.contains('/') && store.contains(target) {
        let config = store.resolve(target)?.load_config()?;
        if let Some(recorded) = config.get("image", "reference") {
            info!(layer = target, reference = recorded, "resolved layer to its image reference");
            return ImageReference::parse(recorded);
        }
    }
    ImageReference::parse(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LayerStore;
    use tempfile::TempDir;

    #[test]
    fn pull_target_falls_through_to_reference_parsing() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path().join("store")).unwrap();
        let reference =
            resolve_pull_target(&store, "registry-1.docker.io/library/ubuntu:latest").unwrap();
        assert_eq!(reference.short_name(), "ubuntu");
    }

    #[test]
    fn pull_target_resolves_recorded_references() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path().join("store")).unwrap();
        let mut config = Config::new();
        config.set("image", "reference", "ghcr.io/owner/app:v2");
        store.create("app", None, Some(&config)).unwrap();

        let reference = resolve_pull_target(&store, "app").unwrap();
        assert_eq!(reference.registry, "ghcr.io");
        assert_eq!(reference.reference, "v2");
    }

    #[test]
    fn bare_unknown_names_are_rejected() {
        let temp = TempDir::new().unwrap();
        let store = LayerStore::open(temp.path().join("store")).unwrap();
        assert!(resolve_pull_target(&store, "nosuchlayer").is_err());
    }
}
