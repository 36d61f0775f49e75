//! Challenge-response authentication.
//!
//! The host challenges every new session with its own token. The peer signs
//! the token with a private key and answers with its username and email;
//! the host looks up the public keys registered for that user and accepts the
//! first key that verifies. The answer may instead name another pending
//! session's token, letting an authenticated session approve that login.

use crate::protocol::messages::{
    AuthAttempt, AuthRequest, DelegatedAuth, UNAUTHORIZED, UserProfile, names,
};
use crate::session::{SessionRegistry, short};
use crate::transport::Transport;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Displays as the wire reason so it can be sent as-is.
    #[error("401")]
    Unauthorized(String),

    #[error("User directory error: {0}")]
    Directory(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl AuthError {
    fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }
}

/// A public key registered to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedKey {
    pub name: String,
    pub public_key: String,
}

/// A user as stored in the directory, key material included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub public_keys: Vec<NamedKey>,
    #[serde(default)]
    pub logs: Vec<AuthAttempt>,
}

impl UserRecord {
    /// The profile shown to peers, without key material.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            username: self.username.clone(),
            name: self.name.clone(),
            emails: self.emails.clone(),
            logs: self.logs.clone(),
        }
    }
}

/// User directory consulted during authentication.
#[async_trait]
pub trait DirectoryOracle: Send + Sync {
    /// Every public key registered to the user.
    async fn public_keys_by_email(
        &self,
        username: Option<&str>,
        email: Option<&str>,
    ) -> Result<Vec<NamedKey>, AuthError>;

    /// Record an attempt. Returns the canonical record on success, if the user exists.
    async fn record_auth_attempt(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        success: bool,
    ) -> Result<Option<UserRecord>, AuthError>;
}

/// Signature primitive.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &str, signature: &str, plaintext: &[u8]) -> bool;
}

/// Ed25519 over base64 encoded keys and signatures.
///
/// Malformed keys or signatures simply fail verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &str, signature: &str, plaintext: &[u8]) -> bool {
        let Ok(key_bytes) = STANDARD.decode(public_key.trim()) else {
            return false;
        };
        let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature_bytes) = STANDARD.decode(signature.trim()) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };
        key.verify(plaintext, &signature).is_ok()
    }
}

/// Peer-side signing key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a fresh key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load from a base64 encoded 32-byte seed.
    pub fn from_base64(seed: &str) -> Result<Self, AuthError> {
        let bytes = STANDARD
            .decode(seed.trim())
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let seed = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| AuthError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn seed_base64(&self) -> String {
        STANDARD.encode(self.key.to_bytes())
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.key.verifying_key().as_bytes())
    }

    /// Sign a challenge token, returning the base64 signature.
    pub fn sign(&self, token: &str) -> String {
        STANDARD.encode(self.key.sign(token.as_bytes()).to_bytes())
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// The caller authenticated itself.
    Direct {
        session: String,
        profile: UserProfile,
        first: bool,
    },
    /// The caller approved another session.
    Delegated {
        target: String,
        profile: UserProfile,
        first: bool,
    },
}

impl AuthOutcome {
    /// The session that became authenticated.
    pub fn session(&self) -> &str {
        match self {
            AuthOutcome::Direct { session, .. } => session,
            AuthOutcome::Delegated { target, .. } => target,
        }
    }

    /// Whether the session was not authenticated before this attempt.
    pub fn first(&self) -> bool {
        match self {
            AuthOutcome::Direct { first, .. } | AuthOutcome::Delegated { first, .. } => *first,
        }
    }
}

pub struct Authenticator {
    registry: SessionRegistry,
    oracle: Arc<dyn DirectoryOracle>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl Authenticator {
    pub fn new(
        registry: SessionRegistry,
        oracle: Arc<dyn DirectoryOracle>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            registry,
            oracle,
            verifier,
        }
    }

    /// Verify an `AUTH` answer from `caller`.
    ///
    /// On success the target session is marked authenticated. Delegation is
    /// not scoped: any authenticated session may approve any pending token.
    pub async fn authenticate(
        &self,
        caller: &str,
        request: &AuthRequest,
    ) -> Result<AuthOutcome, AuthError> {
        let target = request.token.as_deref().unwrap_or(caller);
        let delegated = target != caller;

        if delegated && !self.registry.is_authenticated(caller) {
            debug!(
                "Session {} tried to approve {} before authenticating",
                short(caller),
                short(target)
            );
            return Err(AuthError::unauthorized("unauthenticated delegation"));
        }

        let username = request.username.as_deref();
        let email = request.email.as_deref();

        let keys = self.oracle.public_keys_by_email(username, email).await?;

        let live = matches!(self.registry.is_expired(target), Some(false));
        if !live {
            return self.fail(username, email, "unknown or expired session").await;
        }

        let verified = keys
            .iter()
            .find(|key| {
                self.verifier
                    .verify(&key.public_key, &request.signature, target.as_bytes())
            });
        let Some(key) = verified else {
            return self.fail(username, email, "no key verifies").await;
        };

        // The flag is only set once the attempt is recorded and a profile exists
        let record = self.oracle.record_auth_attempt(username, email, true).await?;
        let Some(record) = record else {
            return Err(AuthError::unauthorized("user vanished"));
        };

        let first = self
            .registry
            .mark_authenticated(target)
            .map_err(|e| AuthError::unauthorized(e.to_string()))?;

        info!(
            "Session {} authenticated as {} with key {}",
            short(target),
            record.username,
            key.name
        );

        let profile = record.profile();
        Ok(if delegated {
            AuthOutcome::Delegated {
                target: target.to_string(),
                profile,
                first,
            }
        } else {
            AuthOutcome::Direct {
                session: target.to_string(),
                profile,
                first,
            }
        })
    }

    async fn fail(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        reason: &str,
    ) -> Result<AuthOutcome, AuthError> {
        warn!(
            "Authentication failed for {}: {}",
            username.or(email).unwrap_or("<anonymous>"),
            reason
        );
        self.oracle.record_auth_attempt(username, email, false).await?;
        Err(AuthError::unauthorized(reason))
    }

    /// Authenticate and answer over the connections involved.
    ///
    /// Delegated success pushes `USR` to the target and answers the caller
    /// with `AUTH_USR`. Any failure answers the caller with `ERR "401"`.
    pub async fn answer(
        &self,
        caller: &str,
        connection: &Transport,
        request: Option<AuthRequest>,
    ) -> Option<AuthOutcome> {
        let result = match request {
            Some(request) => self.authenticate(caller, &request).await,
            None => Err(AuthError::unauthorized("malformed AUTH payload")),
        };

        match result {
            Ok(outcome) => {
                match &outcome {
                    AuthOutcome::Direct { profile, .. } => {
                        let _ = connection.send_json(names::USR, profile);
                    }
                    AuthOutcome::Delegated {
                        target, profile, ..
                    } => {
                        if let Some(target_connection) = self.registry.connection(target) {
                            let _ = target_connection.send_json(names::USR, profile);
                        }
                        let _ = connection.send_json(
                            names::AUTH_USR,
                            &DelegatedAuth {
                                user: profile.clone(),
                                token: target.clone(),
                            },
                        );
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                debug!("Rejecting AUTH from {}: {:?}", short(caller), e);
                let _ = connection.send_json(names::ERR, &UNAUTHORIZED);
                None
            }
        }
    }
}
