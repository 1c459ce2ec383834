//! Demo TLS material for a cluster.
//!
//! Generates a self-signed CA and one server certificate whose SANs cover
//! every node name, `localhost`, `127.0.0.1` and the consensus store's
//! conventional server name. Meant for bringing up a test cluster; production
//! deployments supply their own certificates.

use std::fmt;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tracing::info;
use zeroize::Zeroizing;

use crate::cluster::ClusterConfig;
use crate::error::TlsError;
use crate::rollout::SecureMaterial;

/// Server name the consensus agents verify against.
pub const CONSENSUS_SERVER_NAME: &str = "server.dc1.consul";

/// Generated CA and server certificate, PEM encoded.
pub struct ClusterTlsMaterial {
    pub ca_cert_pem: String,
    pub server_cert_pem: String,
    pub server_key_pem: Zeroizing<String>,
}

impl ClusterTlsMaterial {
    /// Rollout material from this certificate set.
    #[must_use]
    pub fn into_secure_material(self, gossip_key: Option<String>) -> SecureMaterial {
        SecureMaterial {
            tls_key: Some(self.server_key_pem),
            tls_cert: Some(self.server_cert_pem),
            ca_cert: Some(self.ca_cert_pem),
            gossip_key,
        }
    }
}

impl fmt::Debug for ClusterTlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTlsMaterial").finish_non_exhaustive()
    }
}

/// Generate a CA and a server certificate for every node of `config`.
///
/// # Errors
///
/// Returns [`TlsError::Generation`] if key generation or signing fails.
pub fn generate_cluster_material(config: &ClusterConfig) -> Result<ClusterTlsMaterial, TlsError> {
    let generation = |e: rcgen::Error| TlsError::Generation {
        reason: e.to_string(),
    };

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).map_err(generation)?;
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "quorum cluster CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().map_err(generation)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(generation)?;

    let mut names: Vec<String> = config.nodes().iter().map(|n| n.name.clone()).collect();
    names.extend(
        [CONSENSUS_SERVER_NAME, "localhost", "127.0.0.1"]
            .iter()
            .map(|s| (*s).to_owned()),
    );
    let mut server_params = CertificateParams::new(names).map_err(generation)?;
    server_params
        .distinguished_name
        .push(DnType::CommonName, CONSENSUS_SERVER_NAME);
    let server_key = KeyPair::generate().map_err(generation)?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(generation)?;

    info!(nodes = config.node_count(), "generated cluster TLS material");

    Ok(ClusterTlsMaterial {
        ca_cert_pem: ca_cert.pem(),
        server_cert_pem: server_cert.pem(),
        server_key_pem: Zeroizing::new(server_key.serialize_pem()),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_material_passes_rollout_validation() {
        let config = ClusterConfig::uniform("vault", 3, 8200).unwrap();
        let tls = generate_cluster_material(&config).unwrap();
        assert!(tls.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(tls.server_key_pem.contains("PRIVATE KEY"));
        assert_ne!(tls.ca_cert_pem, tls.server_cert_pem);

        let material = tls.into_secure_material(None);
        assert!(material.validate().is_ok());
    }
}
