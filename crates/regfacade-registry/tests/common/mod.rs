//! Shared test fixtures: an in-process upstream registry and image spec
//! service the facade can pull from over localhost.

// Each integration test binary compiles this module; not every binary
// uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use regfacade_registry::oci::{
    Descriptor, Digest, ImageManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP,
    MEDIA_TYPE_OCI_MANIFEST,
};

/// A layer planted in the fake upstream.
pub struct UpstreamLayer {
    pub data: Bytes,
    pub diff_id: Digest,
}

impl UpstreamLayer {
    /// Gzips `payload` so the layer is structurally what the facade
    /// expects, and records the matching diff-id.
    pub fn gzipped(payload: &[u8]) -> Self {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload).unwrap();
        Self {
            data: Bytes::from(encoder.finish().unwrap()),
            diff_id: Digest::from_bytes(payload),
        }
    }
}

#[derive(Default)]
struct UpstreamState {
    manifests: HashMap<String, Bytes>,
    blobs: HashMap<String, Bytes>,
    manifest_hits: HashMap<String, AtomicUsize>,
    blob_hits: HashMap<String, AtomicUsize>,
}

/// In-process registry the facade pulls base/ide images from.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    state: Arc<Mutex<UpstreamState>>,
}

impl FakeUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(UpstreamState::default()));
        let app = Router::new()
            .route("/v2/{*rest}", get(serve_upstream))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Host string usable in image references, e.g. "127.0.0.1:39001".
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Publishes an image and returns (reference, manifest digest, config
    /// digest, layer digests).
    pub fn add_image(
        &self,
        repo: &str,
        tag: &str,
        layers: &[UpstreamLayer],
    ) -> (String, Digest, Digest, Vec<Digest>) {
        let diff_ids: Vec<String> = layers.iter().map(|l| l.diff_id.to_string()).collect();
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/bin"],
                "Entrypoint": ["/sbin/init"],
            },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
            "history": layers.iter().map(|_| serde_json::json!({"created_by": "test"})).collect::<Vec<_>>(),
        });
        let config_bytes = Bytes::from(serde_json::to_vec(&config).unwrap());
        let config_digest = Digest::from_bytes(&config_bytes);

        let layer_descriptors: Vec<Descriptor> = layers
            .iter()
            .map(|l| {
                Descriptor::new(
                    MEDIA_TYPE_OCI_LAYER_GZIP,
                    Digest::from_bytes(&l.data),
                    l.data.len() as u64,
                )
            })
            .collect();
        let layer_digests: Vec<Digest> =
            layer_descriptors.iter().map(|d| d.digest.clone()).collect();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            config: Descriptor::new(
                MEDIA_TYPE_OCI_CONFIG,
                config_digest.clone(),
                config_bytes.len() as u64,
            ),
            layers: layer_descriptors,
        };
        let manifest_bytes = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let manifest_digest = Digest::from_bytes(&manifest_bytes);

        let mut state = self.state.lock().unwrap();
        state
            .manifests
            .insert(format!("{repo}/{tag}"), manifest_bytes.clone());
        state
            .manifests
            .insert(format!("{repo}/{manifest_digest}"), manifest_bytes);
        state.blobs.insert(config_digest.to_string(), config_bytes);
        for (descriptor, layer) in layer_digests.iter().zip(layers) {
            state
                .blobs
                .insert(descriptor.to_string(), layer.data.clone());
        }

        (
            format!("{}/{repo}:{tag}", self.host()),
            manifest_digest,
            config_digest,
            layer_digests,
        )
    }

    /// How many manifest GETs hit `repo/<ref>`.
    pub fn manifest_hits(&self, repo: &str, reference: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .manifest_hits
            .get(&format!("{repo}/{reference}"))
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// How many blob GETs hit `digest`.
    pub fn blob_hits(&self, digest: &Digest) -> usize {
        let state = self.state.lock().unwrap();
        state
            .blob_hits
            .get(digest.as_str())
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }
}

async fn serve_upstream(
    State(state): State<Arc<Mutex<UpstreamState>>>,
    Path(rest): Path<String>,
) -> Response {
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.len() < 3 {
        return StatusCode::NOT_FOUND.into_response();
    }
    let kind = segments[segments.len() - 2];
    let reference = segments[segments.len() - 1];
    let repo = segments[..segments.len() - 2].join("/");

    let mut state = state.lock().unwrap();
    match kind {
        "manifests" => {
            let key = format!("{repo}/{reference}");
            state
                .manifest_hits
                .entry(key.clone())
                .or_default()
                .fetch_add(1, Ordering::SeqCst);
            match state.manifests.get(&key) {
                Some(bytes) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, MEDIA_TYPE_OCI_MANIFEST)],
                    Body::from(bytes.clone()),
                )
                    .into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        "blobs" => {
            state
                .blob_hits
                .entry(reference.to_string())
                .or_default()
                .fetch_add(1, Ordering::SeqCst);
            match state.blobs.get(reference) {
                Some(bytes) => (StatusCode::OK, Body::from(bytes.clone())).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Writes a gzip'd layer file to disk and returns (path, raw bytes,
/// digest).
pub fn write_layer_file(
    dir: &std::path::Path,
    name: &str,
    payload: &[u8],
) -> (std::path::PathBuf, Vec<u8>, Digest) {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(payload).unwrap();
    encoder.finish().unwrap();

    let raw = std::fs::read(&path).unwrap();
    let digest = Digest::from_bytes(&raw);
    (path, raw, digest)
}
