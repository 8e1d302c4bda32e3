//! Certificate store: hardcoded trusted roots, issued-cert records, a
//! revocation set, and chain verification with app-ID/POP-ID restriction
//! intersection.

use std::collections::{BTreeSet, HashMap};

use ed25519_dalek::{Signature, VerifyingKey};

use crate::crypto::verify_signature;
use crate::error::{NetError, Result};

pub type KeyId = u64;

/// `None` means "unrestricted" (the universal set); `Some(set)` restricts
/// to exactly those values. Intersection composes the usual way, with
/// `None` acting as the identity element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restriction<T: Ord + Clone> {
    Unrestricted,
    Limited(BTreeSet<T>),
}

impl<T: Ord + Clone> Restriction<T> {
    pub fn contains(&self, v: &T) -> bool {
        match self {
            Restriction::Unrestricted => true,
            Restriction::Limited(set) => set.contains(v),
        }
    }

    pub fn intersect(&self, other: &Restriction<T>) -> Restriction<T> {
        match (self, other) {
            (Restriction::Unrestricted, r) | (r, Restriction::Unrestricted) => r.clone(),
            (Restriction::Limited(a), Restriction::Limited(b)) => {
                Restriction::Limited(a.intersection(b).cloned().collect())
            }
        }
    }
}

/// A single signed certificate: a public key, signed by a CA key, with
/// validity window and optional app-ID/POP-ID restrictions.
#[derive(Debug, Clone)]
pub struct Cert {
    pub key_id: KeyId,
    pub public_key: VerifyingKey,
    pub ca_key_id: KeyId,
    pub signature: Signature,
    pub not_before: u64,
    pub not_after: u64,
    pub app_ids: Restriction<u32>,
    pub pop_ids: Restriction<[u8; 4]>,
}

impl Cert {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.key_id.to_be_bytes());
        buf.extend_from_slice(self.public_key.as_bytes());
        buf.extend_from_slice(&self.ca_key_id.to_be_bytes());
        buf.extend_from_slice(&self.not_before.to_be_bytes());
        buf.extend_from_slice(&self.not_after.to_be_bytes());
        buf
    }
}

/// The verified, effective permission scope of a cert chain: the
/// intersection of every link's restrictions. Returned by `check_cert` so
/// repeated `app_id`/`pop_id` queries against one packet don't re-verify
/// the chain each time.
#[derive(Debug, Clone)]
pub struct CertAuthScope {
    app_ids: Restriction<u32>,
    pop_ids: Restriction<[u8; 4]>,
}

impl CertAuthScope {
    pub fn allows_app_id(&self, app_id: u32) -> bool {
        self.app_ids.contains(&app_id)
    }

    pub fn allows_pop_id(&self, pop_id: [u8; 4]) -> bool {
        self.pop_ids.contains(&pop_id)
    }
}

/// Holds hardcoded root keys, issued certs (indexed by key ID so a chain
/// can be walked CA-by-CA), and a revocation set.
#[derive(Default)]
pub struct CertStore {
    roots: HashMap<KeyId, VerifyingKey>,
    certs: HashMap<KeyId, Cert>,
    revoked: BTreeSet<KeyId>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root(&mut self, key_id: KeyId, public_key: VerifyingKey) {
        self.roots.insert(key_id, public_key);
    }

    pub fn add_cert(&mut self, cert: Cert) {
        self.certs.insert(cert.key_id, cert);
    }

    pub fn add_key_revocation(&mut self, key_id: KeyId) {
        self.revoked.insert(key_id);
    }

    /// Verifies the signature chain from `leaf` back to a hardcoded root,
    /// checking validity windows and revocation at every link, and
    /// returns the intersected permission scope on success.
    pub fn check_cert(&self, leaf: &Cert, now: u64) -> Result<CertAuthScope> {
        let mut scope_app = Restriction::Unrestricted;
        let mut scope_pop = Restriction::Unrestricted;

        let mut current = leaf.clone();
        loop {
            if self.revoked.contains(&current.key_id) {
                return Err(NetError::AuthenticationFailure(format!(
                    "key {} is revoked",
                    current.key_id
                )));
            }
            if now < current.not_before || now > current.not_after {
                return Err(NetError::AuthenticationFailure(format!(
                    "cert {} is outside its validity window",
                    current.key_id
                )));
            }

            scope_app = scope_app.intersect(&current.app_ids);
            scope_pop = scope_pop.intersect(&current.pop_ids);

            if let Some(&root_key) = self.roots.get(&current.ca_key_id) {
                if self.revoked.contains(&current.ca_key_id) {
                    return Err(NetError::AuthenticationFailure(format!(
                        "root key {} is revoked",
                        current.ca_key_id
                    )));
                }
                verify_signature(&root_key, &current.signed_bytes(), &current.signature)?;
                return Ok(CertAuthScope { app_ids: scope_app, pop_ids: scope_pop });
            }

            let ca_cert = self
                .certs
                .get(&current.ca_key_id)
                .ok_or_else(|| NetError::AuthenticationFailure("CA key not found in chain".to_string()))?
                .clone();
            verify_signature(&ca_cert.public_key, &current.signed_bytes(), &current.signature)?;
            current = ca_cert;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningIdentity;

    fn make_root() -> (SigningIdentity, KeyId) {
        (SigningIdentity::generate(), 1)
    }

    fn sign_cert(
        key_id: KeyId,
        signer: &SigningIdentity,
        subject: &SigningIdentity,
        ca_key_id: KeyId,
        app_ids: Restriction<u32>,
        pop_ids: Restriction<[u8; 4]>,
    ) -> Cert {
        let mut cert = Cert {
            key_id,
            public_key: subject.verifying_key(),
            ca_key_id,
            signature: signer.sign(&[]),
            not_before: 0,
            not_after: u64::MAX,
            app_ids,
            pop_ids,
        };
        cert.signature = signer.sign(&cert.signed_bytes());
        cert
    }

    fn pop(s: &str) -> [u8; 4] {
        let b = s.as_bytes();
        let mut out = [0u8; 4];
        out[..b.len()].copy_from_slice(b);
        out
    }

    #[test]
    fn pki_001_s3_intersection_and_scope_queries() {
        let (root, root_id) = make_root();
        let intermediate = SigningIdentity::generate();
        let leaf = SigningIdentity::generate();

        let mut store = CertStore::new();
        store.add_root(root_id, root.verifying_key());

        let c1 = sign_cert(
            2,
            &root,
            &intermediate,
            root_id,
            Restriction::Limited([730].into_iter().collect()),
            Restriction::Limited([pop("eat"), pop("mwh")].into_iter().collect()),
        );
        store.add_cert(c1.clone());

        let c2 = sign_cert(
            3,
            &intermediate,
            &leaf,
            2,
            Restriction::Unrestricted,
            Restriction::Limited([pop("eat"), pop("mwh"), pop("iad")].into_iter().collect()),
        );

        let scope = store.check_cert(&c2, 100).expect("chain should verify");
        assert!(scope.allows_app_id(730));
        assert!(!scope.allows_app_id(570));
        assert!(scope.allows_pop_id(pop("mwh")));
        assert!(!scope.allows_pop_id(pop("iad")));
    }

    #[test]
    fn pki_002_s4_revocation_fails_chain() {
        let (root, root_id) = make_root();
        let intermediate = SigningIdentity::generate();
        let leaf = SigningIdentity::generate();

        let mut store = CertStore::new();
        store.add_root(root_id, root.verifying_key());

        let c1 = sign_cert(2, &root, &intermediate, root_id, Restriction::Unrestricted, Restriction::Unrestricted);
        store.add_cert(c1);

        let c2 = sign_cert(3, &intermediate, &leaf, 2, Restriction::Unrestricted, Restriction::Unrestricted);

        assert!(store.check_cert(&c2, 100).is_ok());
        store.add_key_revocation(2);
        assert!(store.check_cert(&c2, 100).is_err());
    }

    #[test]
    fn pki_003_untrusted_root_fails() {
        let stray_root = SigningIdentity::generate();
        let leaf = SigningIdentity::generate();
        let store = CertStore::new();
        let c = sign_cert(1, &stray_root, &leaf, 999, Restriction::Unrestricted, Restriction::Unrestricted);
        assert!(store.check_cert(&c, 100).is_err());
    }

    #[test]
    fn pki_004_expired_cert_fails() {
        let (root, root_id) = make_root();
        let leaf = SigningIdentity::generate();
        let mut store = CertStore::new();
        store.add_root(root_id, root.verifying_key());
        let mut c = sign_cert(2, &root, &leaf, root_id, Restriction::Unrestricted, Restriction::Unrestricted);
        c.not_after = 50;
        c.signature = root.sign(&c.signed_bytes());
        assert!(store.check_cert(&c, 100).is_err());
    }
}
