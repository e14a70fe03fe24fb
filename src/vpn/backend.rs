use async_trait::async_trait;

use crate::artifacts::Protocol;
use crate::error::ProvisionResult;
use crate::identity::ClientIdentity;

/// Common interface that every protocol manager implements
///
/// `init` prepares server-side state and is safe to repeat. `add` issues or
/// reissues credentials for one identity and writes its client profiles;
/// `delete` revokes them. Callers hold the appropriate lock from
/// [`crate::lock::LockRegistry`] around every call.
#[async_trait]
pub trait ProtocolManager: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Idempotent server-side preparation
    async fn init(&self) -> ProvisionResult<()>;

    async fn add(&self, identity: &ClientIdentity) -> ProvisionResult<()>;

    /// Returns [`crate::ProvisionError::NotFound`] if nothing was provisioned
    async fn delete(&self, identity: &ClientIdentity) -> ProvisionResult<()>;
}
