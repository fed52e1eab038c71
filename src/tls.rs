use anyhow::{Context, Result, anyhow};
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader, sync::Arc};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tracing::{debug, warn};

use crate::config::UpstreamTlsConfig;

/// Builds the client configuration used for encrypted upstream connections.
///
/// Certificates are verified against `ca_file` when set, otherwise against the
/// platform trust store. With `verify_certificates = false` any certificate is
/// accepted, but handshake signatures are still checked.
pub fn load_client_config(tls_config: &UpstreamTlsConfig) -> Result<ClientConfig> {
    if !tls_config.verify_certificates {
        warn!("Upstream certificate verification is disabled");
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth();
        return Ok(config);
    }

    let roots = match &tls_config.ca_file {
        Some(ca_file) => load_ca_file(ca_file)?,
        None => load_native_roots()?,
    };

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_ca_file(path: &str) -> Result<RootCertStore> {
    let file = File::open(path).with_context(|| format!("Failed to open CA file: {path}"))?;

    let ca_certs = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA file")?;

    if ca_certs.is_empty() {
        return Err(anyhow!("No certificates found in CA file"));
    }

    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .with_context(|| format!("Invalid CA certificate in {path}"))?;
    }
    Ok(roots)
}

fn load_native_roots() -> Result<RootCertStore> {
    let result = rustls_native_certs::load_native_certs();
    for error in &result.errors {
        warn!(error = %error, "Failed to load a platform certificate");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(result.certs);
    debug!(added, ignored, "Loaded platform trust store");

    if roots.is_empty() {
        return Err(anyhow!("No usable certificates found in the platform trust store"));
    }
    Ok(roots)
}

pub fn server_name(name: &str) -> Option<ServerName<'static>> {
    ServerName::try_from(name.to_string()).ok()
}

#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
