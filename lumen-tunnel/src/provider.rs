use crate::error::Result;
use crate::manager::TunnelHandle;
use async_trait::async_trait;

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Short provider name for logs: "ngrok".
    fn provider_id(&self) -> &str;

    /// Register the token with the provider. Rejection is a `TunnelError::Auth`.
    async fn authenticate(&self, token: &str) -> Result<()>;

    /// Map a public URL to `local_port` and return that URL.
    async fn open(&self, local_port: u16) -> Result<String>;

    /// Tear down a tunnel previously returned by `open`.
    async fn close_tunnel(&self, handle: &TunnelHandle) -> Result<()>;

    /// Release the authenticated session.
    async fn shutdown(&self) -> Result<()>;
}
