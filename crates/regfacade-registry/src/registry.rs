//! The registry facade coordinator.
//!
//! Wires the blob store, layer sources, spec providers, synthesizer, and
//! blob router together from a [`Config`], and runs the serve loop with
//! optional TLS and zero-downtime listener handover.

use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tower::Service;
use tracing::{error, info, warn};

use crate::api::create_router;
use crate::config::{Config, StaticLayerKind, TlsConfig};
use crate::error::{FacadeError, Result};
use crate::handover::{offer_handover, receive_handover, HandoverOffer};
use crate::modifier::ConfigModifier;
use crate::provider::{
    CachingSpecProvider, FixedSpecProvider, ImageSpecProvider, ProviderTls, RemoteSpecProvider,
    DEFAULT_SPEC_CACHE_CAPACITY,
};
use crate::router::BlobRouter;
use crate::source::{
    CompositeLayerSource, ContentLayerSource, FileLayerSource, LayerSource, RefSelector,
    SpecImageSource, StaticImageSource,
};
use crate::spec::ImageSpec;
use crate::store::{apply_root_prefix, BlobStore};
use crate::synthesizer::ManifestSynthesizer;
use crate::upstream::ResolverFactory;

/// Provider name reserved for the remote spec service.
pub const PROVIDER_REMOTE: &str = "remote";

/// Provider name reserved for the config-declared fixed spec.
pub const PROVIDER_STATIC: &str = "static";

/// The assembled facade.
pub struct Registry {
    config: Config,
    providers: HashMap<String, Arc<dyn ImageSpecProvider>>,
    synthesizer: ManifestSynthesizer,
    blob_router: BlobRouter,
    store: Arc<BlobStore>,
}

impl Registry {
    /// Builds the facade from its configuration.
    ///
    /// Static image sources fetch their manifests here, so startup fails
    /// fast on unreachable upstreams.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened, a static layer
    /// cannot be prepared, or the spec provider cannot be configured.
    pub async fn new(config: Config, factory: ResolverFactory) -> Result<Self> {
        let store = Arc::new(BlobStore::new(apply_root_prefix(&config.store))?);

        let base = Arc::new(SpecImageSource::new(factory.clone(), RefSelector::Base));
        let ide = Arc::new(SpecImageSource::new(factory.clone(), RefSelector::Ide));

        // Child order is the final filesystem stacking order: base, ide,
        // configured static layers, then dynamic content.
        let mut sources: Vec<Arc<dyn LayerSource>> =
            vec![Arc::clone(&base) as _, Arc::clone(&ide) as _];

        info!(count = config.static_layer.len(), "preparing static layers");
        for static_layer in &config.static_layer {
            let source: Arc<dyn LayerSource> = match static_layer.kind {
                StaticLayerKind::File => {
                    let path = apply_root_prefix(std::path::Path::new(&static_layer.reference));
                    Arc::new(FileLayerSource::new(&path).await.map_err(|e| {
                        FacadeError::Internal(format!(
                            "cannot source layer from {}: {e}",
                            static_layer.reference
                        ))
                    })?)
                }
                StaticLayerKind::Image => Arc::new(
                    StaticImageSource::new(factory.clone(), &static_layer.reference)
                        .await
                        .map_err(|e| {
                            FacadeError::Internal(format!(
                                "cannot source layer from {}: {e}",
                                static_layer.reference
                            ))
                        })?,
                ),
            };
            sources.push(source);
        }

        sources.push(Arc::new(ContentLayerSource::new(Arc::clone(&store))?));

        let composite = Arc::new(CompositeLayerSource::new(sources));
        let modifier = Arc::new(ConfigModifier::new(Arc::clone(&composite)));
        let synthesizer = ManifestSynthesizer::new(
            base,
            ide,
            Arc::clone(&composite),
            modifier,
            Arc::clone(&store),
        );
        let blob_router = BlobRouter::new(Arc::clone(&store), composite);

        let mut providers: HashMap<String, Arc<dyn ImageSpecProvider>> = HashMap::new();
        if let Some(remote) = &config.remote_spec_provider {
            let tls = remote.tls.as_ref().map(|tls| ProviderTls {
                ca: tls.ca.clone(),
                crt: tls.crt.clone(),
                key: tls.key.clone(),
            });
            let provider = RemoteSpecProvider::new(&remote.addr, tls.as_ref())?;
            providers.insert(
                PROVIDER_REMOTE.to_string(),
                Arc::new(CachingSpecProvider::new(
                    DEFAULT_SPEC_CACHE_CAPACITY,
                    provider,
                )),
            );
            info!(addr = %remote.addr, "registered remote spec provider");
        }
        if let Some(static_spec) = &config.static_spec {
            let spec = ImageSpec {
                base_ref: static_spec.base_ref.clone(),
                ide_ref: static_spec.ide_ref.clone(),
                content_layer: Vec::new(),
                env_vars: static_spec.env_vars.clone(),
                entrypoint: static_spec.entrypoint.clone(),
                user: static_spec.user.clone(),
            };
            providers.insert(
                PROVIDER_STATIC.to_string(),
                Arc::new(FixedSpecProvider::new(spec)),
            );
            info!(base = %static_spec.base_ref, "registered static spec provider");
        }

        Ok(Self {
            config,
            providers,
            synthesizer,
            blob_router,
            store,
        })
    }

    /// The configuration this facade runs with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Looks up a spec provider by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<dyn ImageSpecProvider>> {
        self.providers.get(name).map(Arc::clone)
    }

    /// The manifest synthesizer.
    #[must_use]
    pub fn synthesizer(&self) -> &ManifestSynthesizer {
        &self.synthesizer
    }

    /// The blob router.
    #[must_use]
    pub fn blob_router(&self) -> &BlobRouter {
        &self.blob_router
    }

    /// The local blob store.
    #[must_use]
    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    /// Runs the facade until shutdown or a completed handover.
    ///
    /// With handover enabled, the listener is taken over from a retiring
    /// predecessor when one offers it, and offered onward to a successor.
    /// Once a successor takes the fd, this instance stops accepting,
    /// drains in-flight requests, and returns cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound or TLS material
    /// cannot be loaded.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let app = create_router(Arc::clone(&self));

        let handover_enabled = self.config.handover.enabled
            && !self.config.handover.sockets.as_os_str().is_empty();

        let mut listener = None;
        if handover_enabled {
            match receive_handover(&self.config.handover.sockets).await {
                Ok(taken) => listener = taken,
                Err(e) => warn!(error = %e, "handover failed - binding listener directly"),
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind(("0.0.0.0", self.config.port))
                .await
                .map_err(|e| {
                    FacadeError::Internal(format!("cannot bind port {}: {e}", self.config.port))
                })?,
        };

        let offer = if handover_enabled {
            Some(offer_handover(&self.config.handover.sockets, &listener).await?)
        } else {
            None
        };

        let tls_acceptor = match &self.config.tls {
            Some(tls) => Some(build_tls_acceptor(tls)?),
            None => None,
        };

        info!(
            port = self.config.port,
            https = tls_acceptor.is_some(),
            handover = handover_enabled,
            "registry facade listening"
        );

        self.accept_loop(listener, app, tls_acceptor, offer).await;
        Ok(())
    }

    /// Accepts connections until a shutdown signal or a completed
    /// handover, then drains.
    async fn accept_loop(
        &self,
        listener: TcpListener,
        app: axum::Router,
        tls_acceptor: Option<TlsAcceptor>,
        offer: Option<HandoverOffer>,
    ) {
        let tracker = TaskTracker::new();
        let (drain_tx, drain_rx) = watch::channel(false);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        let mut handover_rx = offer.as_ref().map(|o| o.handed_over.clone());

        loop {
            let handed_over = async {
                match handover_rx.as_mut() {
                    Some(rx) => {
                        // Either a change or a closed channel means the
                        // offer task is done with the listener.
                        let _ = rx.changed().await;
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::trace!(peer = %peer, "accepted connection");

                    let app = app.clone();
                    let drain = drain_rx.clone();
                    match tls_acceptor.clone() {
                        Some(acceptor) => {
                            tracker.spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        serve_connection(tls_stream, app, drain).await;
                                    }
                                    Err(e) => warn!(error = %e, "TLS handshake failed"),
                                }
                            });
                        }
                        None => {
                            tracker.spawn(serve_connection(stream, app, drain));
                        }
                    }
                }
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                () = handed_over => {
                    info!("listener handed over - not accepting new connections");
                    break;
                }
            }
        }

        // Stop accepting: the kernel backlog now belongs to the successor
        // (if any), then finish what is already in flight.
        drop(listener);
        if let Some(offer) = offer {
            offer.close().await;
        }
        let _ = drain_tx.send(true);
        tracker.close();
        tracker.wait().await;
        info!("drain complete");
    }
}

/// Drives one HTTP/1 connection, honoring the drain signal with a
/// graceful connection shutdown (in-flight requests finish, keep-alive
/// ends).
async fn serve_connection<I>(io: I, app: axum::Router, mut drain: watch::Receiver<bool>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        app.clone().call(request)
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = *drain.borrow();
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    let message = e.to_string().to_lowercase();
                    if !message.contains("connection reset") && !message.contains("broken pipe") {
                        error!("error serving connection: {e}");
                    }
                }
                return;
            }
            changed = drain.changed(), if !draining => {
                draining = true;
                if changed.is_ok() && *drain.borrow() {
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    }
}

/// Loads the server certificate and builds a TLS acceptor.
fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let crt_path = apply_root_prefix(&tls.crt);
    let key_path = apply_root_prefix(&tls.key);

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(&crt_path)
            .map_err(|e| FacadeError::Internal(format!("cannot read {}: {e}", crt_path.display())))?,
    ))
    .collect::<std::io::Result<Vec<_>>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(&key_path)
            .map_err(|e| FacadeError::Internal(format!("cannot read {}: {e}", key_path.display())))?,
    ))?
    .ok_or_else(|| FacadeError::Internal(format!("no private key in {}", key_path.display())))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FacadeError::Internal(format!("TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
