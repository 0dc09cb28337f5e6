//! TLS origination for calls to the upstream lookup service.
//!
//! The upstream is usually reached over HTTPS. The connector verifies
//! servers against the Mozilla root store shipped in [`webpki_roots`] and
//! still accepts plain `http://` endpoints, which local test backends use.

use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::HttpConnector;

/// Builds an HTTPS-or-HTTP connector for outbound upstream connections.
pub fn build_https_connector() -> hyper_rustls::HttpsConnector<HttpConnector> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .build()
}
