use std::sync::Arc;

use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;

use crate::TidalError;

/// Client TLS configuration shared by the HTTP client and RTMPS connections:
/// ring provider, safe default protocol versions and the platform verifier.
pub fn client_config() -> Result<ClientConfig, TidalError> {
    let provider = Arc::new(ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TidalError::internal(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| TidalError::internal(format!("TLS platform verifier: {e}")))
        .map(|builder| builder.with_no_client_auth())
}
