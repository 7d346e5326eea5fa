//! Admission server

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;

use servicebinding_webhook::{admission_router, AdmissionState};

/// Serve the admission endpoints over TLS until the process exits
pub async fn start_server(
    addr: SocketAddr,
    cert: &Path,
    key: &Path,
    state: Arc<AdmissionState>,
) -> anyhow::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("loading TLS config from {}", cert.display()))?;

    info!(addr = %addr, "Starting admission server");

    axum_server::bind_rustls(addr, tls_config)
        .serve(admission_router(state).into_make_service())
        .await
        .context("admission server error")?;

    Ok(())
}
