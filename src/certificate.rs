//! Role key material.
//!
//! Every local role owns an Ed25519 signing key held by the
//! [`CertificateStore`]; its public half is published as a
//! [`RoleCertificate`].  Certificates of remote roles are fetched through
//! the router and kept in a [`CertificateCache`] whose entries expire, since
//! certificates are long-lived relative to message traffic.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ed25519_dalek::{SigningKey, VerifyingKey};
use log::info;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, MessageError};
use crate::message::Message;
use crate::types::QualifiedName;

/// Default number of remote certificates kept in memory.
pub const CERTIFICATE_CACHE_CAPACITY: usize = 1024;

/// Default lifetime of a cached remote certificate.
pub const CERTIFICATE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Public key of a role, bound to its qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCertificate {
    subject: QualifiedName,
    /// Hex encoded Ed25519 verifying key.
    public_key: String,
}

impl RoleCertificate {
    pub fn new(subject: QualifiedName, key: &VerifyingKey) -> Self {
        Self {
            subject,
            public_key: hex::encode(key.to_bytes()),
        }
    }

    pub fn subject(&self) -> &QualifiedName {
        &self.subject
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, MessageError> {
        let raw = hex::decode(&self.public_key)
            .map_err(|e| MessageError::MalformedSignature(format!("public key: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| MessageError::MalformedSignature("public key: expected 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| MessageError::MalformedSignature(format!("public key: {e}")))
    }
}

/// Signing keys of the roles hosted by this container.
#[derive(Default)]
pub struct CertificateStore {
    keys: RwLock<HashMap<QualifiedName, SigningKey>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a role key and returns the certificate issued for it.
    pub fn insert(&self, subject: QualifiedName, key: SigningKey) -> RoleCertificate {
        let certificate = RoleCertificate::new(subject.clone(), &key.verifying_key());
        self.keys.write().insert(subject, key);
        certificate
    }

    pub fn remove(&self, subject: &QualifiedName) {
        self.keys.write().remove(subject);
    }

    /// Certificate of a local role, if this container hosts it.
    pub fn certificate_for(&self, subject: &QualifiedName) -> Option<RoleCertificate> {
        self.keys
            .read()
            .get(subject)
            .map(|key| RoleCertificate::new(subject.clone(), &key.verifying_key()))
    }

    /// Signs `message` with its sender's key.
    pub fn sign(&self, message: Message) -> Result<Message, DispatchError> {
        let keys = self.keys.read();
        let key = keys
            .get(message.sender())
            .ok_or_else(|| DispatchError::MissingSigningKey(message.sender().clone()))?;
        Ok(message.sign(key)?)
    }

    /// Loads the role key stored under `base/roles/<subject>.key`, generating
    /// and saving a new one on first use.
    pub fn load_or_generate(base: &Path, subject: &QualifiedName) -> anyhow::Result<SigningKey> {
        let path = role_key_path(base, subject);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid key file {:?}: expected 32 bytes", path))?;
            info!("Loaded signing key for {} from {:?}", subject, path);
            return Ok(SigningKey::from_bytes(&arr));
        }

        let key = SigningKey::generate(&mut OsRng);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_secret(&path, &key.to_bytes())?;
        info!("Generated signing key for {}, saved to {:?}", subject, path);
        Ok(key)
    }
}

fn role_key_path(base: &Path, subject: &QualifiedName) -> PathBuf {
    base.join("roles").join(format!("{subject}.key"))
}

fn write_secret(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    // Owner read/write only.
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path)?.write_all(bytes)
}

/// Bounded-lifetime cache of remote role certificates.
pub struct CertificateCache {
    entries: Mutex<LruCache<QualifiedName, (RoleCertificate, Instant)>>,
    ttl: Duration,
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new(CERTIFICATE_CACHE_CAPACITY, CERTIFICATE_CACHE_TTL)
    }
}

impl CertificateCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, subject: &QualifiedName) -> Option<RoleCertificate> {
        self.get_at(subject, Instant::now())
    }

    fn get_at(&self, subject: &QualifiedName, now: Instant) -> Option<RoleCertificate> {
        let mut entries = self.entries.lock();
        match entries.get(subject) {
            Some((certificate, fetched)) if now.duration_since(*fetched) < self.ttl => {
                Some(certificate.clone())
            }
            Some(_) => {
                entries.pop(subject);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, certificate: RoleCertificate) {
        self.insert_at(certificate, Instant::now());
    }

    fn insert_at(&self, certificate: RoleCertificate, now: Instant) {
        self.entries
            .lock()
            .put(certificate.subject().clone(), (certificate, now));
    }

    pub fn invalidate(&self, subject: &QualifiedName) {
        self.entries.lock().pop(subject);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;

    fn name(s: &str) -> QualifiedName {
        s.parse().unwrap()
    }

    #[test]
    fn store_signs_with_the_senders_key() {
        let store = CertificateStore::new();
        let certificate = store.insert(name("alpha.n.a"), SigningKey::generate(&mut OsRng));

        let message = Message::builder(name("alpha.n.a"), name("beta.n.b"), Operation::KeepAliveInfo)
            .build();
        let signed = store.sign(message).unwrap();
        signed
            .verify(&certificate.verifying_key().unwrap())
            .unwrap();

        let foreign = Message::builder(name("alpha.n.z"), name("beta.n.b"), Operation::KeepAliveInfo)
            .build();
        assert!(matches!(
            store.sign(foreign),
            Err(DispatchError::MissingSigningKey(_))
        ));
    }

    #[test]
    fn cache_entries_expire() {
        let cache = CertificateCache::new(4, Duration::from_secs(10));
        let key = SigningKey::generate(&mut OsRng);
        let subject = name("beta.n.b");
        let start = Instant::now();
        cache.insert_at(RoleCertificate::new(subject.clone(), &key.verifying_key()), start);

        assert!(cache.get_at(&subject, start + Duration::from_secs(9)).is_some());
        assert!(cache.get_at(&subject, start + Duration::from_secs(11)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_is_bounded() {
        let cache = CertificateCache::new(2, Duration::from_secs(60));
        for role in ["a", "b", "c"] {
            let key = SigningKey::generate(&mut OsRng);
            cache.insert(RoleCertificate::new(name(&format!("beta.n.{role}")), &key.verifying_key()));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&name("beta.n.a")).is_none());
    }

    #[test]
    fn role_keys_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let subject = name("alpha.n.a");
        let first = CertificateStore::load_or_generate(dir.path(), &subject).unwrap();
        let second = CertificateStore::load_or_generate(dir.path(), &subject).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }
}
