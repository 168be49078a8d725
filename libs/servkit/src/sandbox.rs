//! Contract of the external sandbox that unwraps a protected model
//! artifact. The decryption primitives themselves live outside this crate;
//! only the request/response shape is fixed here.

use std::path::Path;

use async_trait::async_trait;

use crate::error::ServingError;

/// Decrypts a protected model artifact.
///
/// `access_code` is the wrapped key material supplied with the backend
/// configuration, `private_key_path` points at the key that unwraps it,
/// `source_path` is the encrypted artifact on disk. Returns the plaintext
/// bytes; the caller owns writing them into a scratch location and deleting
/// them again.
#[async_trait]
pub trait SandboxDecoder: Send + Sync {
    async fn decode(
        &self,
        access_code: &str,
        private_key_path: &Path,
        source_path: &Path,
    ) -> Result<Vec<u8>, ServingError>;
}
