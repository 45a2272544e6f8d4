//! Client certificate material for gateway authentication.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::debug;

use crate::error::PoolError;

/// Certificate chain and private key presented during the handshake.
pub struct ClientIdentity {
    pub leaf: X509,
    pub intermediates: Vec<X509>,
    pub key: PKey<Private>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("leaf", &self.leaf.subject_name())
            .field("intermediates", &self.intermediates.len())
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    /// Parse a PEM bundle holding the certificate chain and the private key.
    ///
    /// The first certificate is the leaf and must match the key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, String> {
        let mut chain = rustls_pemfile::certs(&mut &pem[..])
            .map(|der| {
                let der = der.map_err(|e| format!("invalid certificate PEM: {e}"))?;
                X509::from_der(&der).map_err(|e| format!("invalid certificate: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        let leaf = chain.next().ok_or_else(|| "no certificate found".to_string())?;

        let key = rustls_pemfile::private_key(&mut &pem[..])
            .map_err(|e| format!("invalid private key PEM: {e}"))?
            .ok_or_else(|| "no private key found".to_string())?;
        let key = PKey::private_key_from_der(key.secret_der()).map_err(|e| format!("invalid private key: {e}"))?;

        let public = leaf.public_key().map_err(|e| format!("unreadable certificate key: {e}"))?;
        if !public.public_eq(&key) {
            return Err("private key does not match the certificate".to_string());
        }
        Ok(Self {
            leaf,
            intermediates: chain.collect(),
            key,
        })
    }
}

/// Resolves a credential identity (the `credential` part of a
/// [`ConnectionKey`](pushpool_core::ConnectionKey)) to client certificate material.
pub trait CredentialProvider: Send + Sync {
    fn identity(&self, credential: &str) -> Result<Arc<ClientIdentity>, PoolError>;
}

/// Loads `<directory>/<credential>` PEM files, caching each parsed identity.
#[derive(Debug)]
pub struct PemCredentialProvider {
    directory: PathBuf,
    cache: Mutex<HashMap<String, Arc<ClientIdentity>>>,
}

impl PemCredentialProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn load(&self, credential: &str) -> Result<ClientIdentity, PoolError> {
        let fail = |reason: String| PoolError::handshake(format!("credential {credential}"), reason);

        // Identities are bare file names inside the credentials directory.
        if credential.is_empty()
            || credential.contains(['/', '\\'])
            || credential == "."
            || credential == ".."
        {
            return Err(fail("invalid credential name".to_string()));
        }
        let path = self.directory.join(credential);
        let pem = std::fs::read(&path).map_err(|e| fail(format!("reading {}: {e}", path.display())))?;
        let identity = ClientIdentity::from_pem(&pem).map_err(fail)?;
        debug!(path = %path.display(), intermediates = identity.intermediates.len(), "loaded client identity");
        Ok(identity)
    }
}

impl CredentialProvider for PemCredentialProvider {
    fn identity(&self, credential: &str) -> Result<Arc<ClientIdentity>, PoolError> {
        if let Ok(cache) = self.cache.lock()
            && let Some(identity) = cache.get(credential)
        {
            return Ok(identity.clone());
        }

        let identity = Arc::new(self.load(credential)?);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(credential.to_string(), identity.clone());
        }
        Ok(identity)
    }
}
