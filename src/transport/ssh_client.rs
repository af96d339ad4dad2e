use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};

/// russh client handler: host key verification only.
pub(crate) struct HostKeyCheck {
    /// OpenSSH SHA256 fingerprints or base64 public keys. Empty accepts any key.
    pub allowed: Vec<String>,
}

impl russh::client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        if self.allowed.is_empty() {
            tracing::warn!(
                fingerprint = %fingerprint,
                "no host_key_fingerprints configured, accepting server key"
            );
            return Ok(true);
        }

        let key_b64 = server_public_key.public_key_base64();
        let ok = self
            .allowed
            .iter()
            .any(|s| s.trim() == fingerprint || s.trim() == key_b64);
        if !ok {
            tracing::error!(fingerprint = %fingerprint, "server host key not in host_key_fingerprints");
        }
        Ok(ok)
    }
}
