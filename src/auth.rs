//! Administrator credential
//!
//! The password that promotes a user to administrator is kept as a SHA-256
//! digest in `auth.json`. The configured password only seeds the file on
//! first start; later changes go through [`AdminAuth::set_password`].

use crate::config::MIN_ADMIN_PASSWORD_LEN;
use crate::storage::{JsonFile, StorageError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

/// Errors returned when changing the password
#[derive(Debug, Error)]
pub enum AuthError {
    /// New password shorter than the minimum
    #[error("the password must be at least {} characters long", MIN_ADMIN_PASSWORD_LEN)]
    TooShort,
    /// New password equals the current one
    #[error("the new password must differ from the current one")]
    Unchanged,
    /// Persisting the credential failed
    #[error("credential storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credential {
    password_sha256: String,
}

fn digest(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Administrator password store
pub struct AdminAuth {
    file: JsonFile,
    credential: RwLock<Credential>,
}

impl AdminAuth {
    /// Opens the credential file, seeding it with `initial_password` if absent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file cannot be read or written.
    pub async fn open(file: JsonFile, initial_password: &str) -> Result<Self, StorageError> {
        let credential = if let Some(existing) = file.load::<Credential>().await? {
            existing
        } else {
            let seeded = Credential {
                password_sha256: digest(initial_password),
            };
            file.save(&seeded).await?;
            info!("Administrator credential initialised");
            seeded
        };
        Ok(Self {
            file,
            credential: RwLock::new(credential),
        })
    }

    /// Whether `password` matches the stored digest
    pub async fn verify(&self, password: &str) -> bool {
        self.credential.read().await.password_sha256 == digest(password)
    }

    /// Replaces the password.
    ///
    /// # Errors
    ///
    /// `TooShort`, `Unchanged` or `Storage`.
    pub async fn set_password(&self, new_password: &str) -> Result<(), AuthError> {
        if new_password.chars().count() < MIN_ADMIN_PASSWORD_LEN {
            return Err(AuthError::TooShort);
        }
        let mut credential = self.credential.write().await;
        let next = Credential {
            password_sha256: digest(new_password),
        };
        if next.password_sha256 == credential.password_sha256 {
            return Err(AuthError::Unchanged);
        }
        self.file.save(&next).await?;
        *credential = next;
        info!("Administrator password changed");
        Ok(())
    }
}
