//! Image config rewriting.
//!
//! The synthesized manifest stacks extra layers on top of the base image,
//! so the base image's config has to be rewritten to match: one diff-id
//! and history entry per added layer, plus the env/entrypoint/user
//! overrides the spec asks for.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::{json, Value};
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

use crate::error::{FacadeError, Result};
use crate::oci::{canonical_json, Digest};
use crate::source::{CompositeLayerSource, LayerEntry, LayerSource};
use crate::spec::ImageSpec;

/// `created_by` value stamped on history entries for added layers.
const HISTORY_CREATED_BY: &str = "registry-facade";

/// Rewrites base image configs for synthesized manifests.
///
/// Computing a diff-id means decompressing the whole layer once; results
/// are cached keyed by the compressed digest and recomputed after restart.
pub struct ConfigModifier {
    layers: Arc<CompositeLayerSource>,
    diff_ids: Mutex<HashMap<Digest, Digest>>,
}

impl ConfigModifier {
    /// Creates a modifier that streams unknown diff-ids from the given
    /// layer source.
    #[must_use]
    pub fn new(layers: Arc<CompositeLayerSource>) -> Self {
        Self {
            layers,
            diff_ids: Mutex::new(HashMap::new()),
        }
    }

    /// Produces the synthesized config for `spec`: the base config with
    /// `appended` layers reflected in rootfs and history, plus the spec's
    /// overrides. The output is canonical JSON.
    ///
    /// # Errors
    ///
    /// Returns an error when the base config cannot be parsed or a
    /// diff-id cannot be computed.
    pub async fn modify(
        &self,
        spec: &ImageSpec,
        base_config: &[u8],
        appended: &[LayerEntry],
    ) -> Result<Vec<u8>> {
        let mut config: Value = serde_json::from_slice(base_config)
            .map_err(|e| FacadeError::UpstreamUnavailable(format!("bad base config: {e}")))?;
        let Some(root) = config.as_object_mut() else {
            return Err(FacadeError::UpstreamUnavailable(
                "base config is not a JSON object".to_string(),
            ));
        };

        let mut diff_ids = Vec::with_capacity(appended.len());
        for entry in appended {
            let diff_id = match &entry.diff_id {
                Some(diff_id) => diff_id.clone(),
                None => self.diff_id(spec, entry).await?,
            };
            diff_ids.push(diff_id);
        }

        append_rootfs(root, &diff_ids)?;
        append_history(root, diff_ids.len());
        apply_overrides(root, spec);

        canonical_json(&config)
    }

    /// Computes (or recalls) the diff-id of a layer: the sha256 of the
    /// uncompressed tar.
    async fn diff_id(&self, spec: &ImageSpec, entry: &LayerEntry) -> Result<Digest> {
        let compressed = &entry.descriptor.digest;
        if let Some(diff_id) = self.diff_ids.lock().await.get(compressed) {
            return Ok(diff_id.clone());
        }

        let read = self.layers.get_blob(spec, compressed, None).await?;
        let reader = StreamReader::new(read.stream);

        let digest_for_log = compressed.clone();
        let diff_id = tokio::task::spawn_blocking(move || -> Result<Digest> {
            let mut decoder = GzDecoder::new(SyncIoBridge::new(reader));
            let mut hasher = Sha256::new();
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = decoder.read(&mut buf).map_err(|e| {
                    FacadeError::Internal(format!("decompress {digest_for_log}: {e}"))
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(Digest::from_sha256_hex(&hex::encode(hasher.finalize())))
        })
        .await
        .map_err(|e| FacadeError::Internal(format!("diff-id task panicked: {e}")))??;

        debug!(compressed = %compressed, diff_id = %diff_id, "computed layer diff-id");
        self.diff_ids
            .lock()
            .await
            .insert(compressed.clone(), diff_id.clone());
        Ok(diff_id)
    }
}

/// Extends `rootfs.diff_ids` with one entry per added layer.
fn append_rootfs(config: &mut serde_json::Map<String, Value>, diff_ids: &[Digest]) -> Result<()> {
    let rootfs = config
        .entry("rootfs")
        .or_insert_with(|| json!({"type": "layers", "diff_ids": []}));
    let ids = rootfs
        .get_mut("diff_ids")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| {
            FacadeError::UpstreamUnavailable("base config rootfs has no diff_ids".to_string())
        })?;
    for diff_id in diff_ids {
        ids.push(Value::String(diff_id.to_string()));
    }
    Ok(())
}

/// Extends `history` with non-empty-layer entries matching the added
/// diff-ids.
fn append_history(config: &mut serde_json::Map<String, Value>, count: usize) {
    let history = config.entry("history").or_insert_with(|| json!([]));
    if let Some(entries) = history.as_array_mut() {
        for _ in 0..count {
            entries.push(json!({
                "created_by": HISTORY_CREATED_BY,
                "empty_layer": false,
            }));
        }
    }
}

/// Applies the spec's env/entrypoint/user overrides to `config.config`.
fn apply_overrides(config: &mut serde_json::Map<String, Value>, spec: &ImageSpec) {
    let container = config.entry("config").or_insert_with(|| json!({}));
    let Some(container) = container.as_object_mut() else {
        return;
    };

    if !spec.env_vars.is_empty() {
        let mut env: Vec<String> = container
            .get("Env")
            .and_then(Value::as_array)
            .map(|vars| {
                vars.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        for var in &spec.env_vars {
            let key = var.split('=').next().unwrap_or(var);
            match env
                .iter()
                .position(|existing| existing.split('=').next() == Some(key))
            {
                // Last writer wins, keeping the original position.
                Some(idx) => env[idx] = var.clone(),
                None => env.push(var.clone()),
            }
        }
        container.insert("Env".to_string(), json!(env));
    }

    if !spec.entrypoint.is_empty() {
        container.insert("Entrypoint".to_string(), json!(spec.entrypoint));
        // A replaced entrypoint invalidates the base image's arguments.
        container.insert("Cmd".to_string(), json!([]));
    }

    if !spec.user.is_empty() {
        container.insert("User".to_string(), json!(spec.user));
    }
}
