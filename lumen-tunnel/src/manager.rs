use crate::error::{Result, TunnelError};
use crate::provider::TunnelProvider;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unconfigured,
    /// A blank token was supplied; the tunnel stays off for the process lifetime.
    Disabled,
    Authenticated,
    Connected,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unconfigured => "unconfigured",
            Self::Disabled => "disabled",
            Self::Authenticated => "authenticated",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub public_url: String,
    pub local_port: u16,
}

pub struct TunnelManager {
    provider: Arc<dyn TunnelProvider>,
    state: TunnelState,
    handle: Option<TunnelHandle>,
}

impl TunnelManager {
    pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
        Self {
            provider,
            state: TunnelState::Unconfigured,
            handle: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn handle(&self) -> Option<&TunnelHandle> {
        self.handle.as_ref()
    }

    pub fn public_url(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.public_url.as_str())
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.provider.provider_id()))]
    pub async fn authenticate(&mut self, token: &str) -> Result<()> {
        self.require(TunnelState::Unconfigured, "authenticate")?;

        if token.trim().is_empty() {
            self.state = TunnelState::Disabled;
            tracing::info!("tunnel token is blank; public tunnel disabled");
            return Ok(());
        }

        self.provider.authenticate(token.trim()).await?;
        self.state = TunnelState::Authenticated;
        tracing::info!("tunnel provider authenticated");
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.provider.provider_id()))]
    pub async fn connect(&mut self, local_port: u16) -> Result<&TunnelHandle> {
        self.require(TunnelState::Authenticated, "connect")?;

        let public_url = self.provider.open(local_port).await?;
        tracing::info!(%public_url, local_port, "tunnel connected");
        self.state = TunnelState::Connected;
        let handle = self.handle.insert(TunnelHandle {
            public_url,
            local_port,
        });
        Ok(&*handle)
    }

    /// Idempotent; never fails. Provider errors are logged.
    #[tracing::instrument(level = "info", skip_all, fields(provider = %self.provider.provider_id()))]
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, TunnelState::Closed);
        match previous {
            TunnelState::Connected => {
                if let Some(handle) = self.handle.take() {
                    if let Err(e) = self.provider.close_tunnel(&handle).await {
                        tracing::warn!(error = %e, public_url = %handle.public_url, "tunnel close failed");
                    }
                }
                self.shutdown_provider().await;
                tracing::info!("tunnel closed");
            }
            TunnelState::Authenticated => {
                self.shutdown_provider().await;
                tracing::info!("tunnel session released");
            }
            TunnelState::Unconfigured | TunnelState::Disabled | TunnelState::Closed => {}
        }
    }

    async fn shutdown_provider(&self) {
        if let Err(e) = self.provider.shutdown().await {
            tracing::warn!(error = %e, "tunnel provider shutdown failed");
        }
    }

    fn require(&self, expected: TunnelState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(TunnelError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProvider {
        calls: Mutex<Vec<String>>,
        reject_token: bool,
        fail_open: bool,
    }

    impl FakeProvider {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls lock").push(call);
        }
    }

    #[async_trait]
    impl TunnelProvider for FakeProvider {
        fn provider_id(&self) -> &str {
            "fake"
        }

        async fn authenticate(&self, token: &str) -> Result<()> {
            self.record(format!("authenticate:{token}"));
            if self.reject_token {
                return Err(TunnelError::Auth("token rejected".to_string()));
            }
            Ok(())
        }

        async fn open(&self, local_port: u16) -> Result<String> {
            self.record(format!("open:{local_port}"));
            if self.fail_open {
                return Err(TunnelError::Connect("quota exceeded".to_string()));
            }
            Ok(format!("https://fake-{local_port}.example"))
        }

        async fn close_tunnel(&self, handle: &TunnelHandle) -> Result<()> {
            self.record(format!("close_tunnel:{}", handle.public_url));
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.record("shutdown".to_string());
            Ok(())
        }
    }

    fn manager_with(provider: FakeProvider) -> (TunnelManager, Arc<FakeProvider>) {
        let provider = Arc::new(provider);
        (TunnelManager::new(provider.clone()), provider)
    }

    #[tokio::test]
    async fn connect_before_authenticate_is_invalid_state() {
        let (mut manager, provider) = manager_with(FakeProvider::default());

        let err = manager.connect(5000).await.expect_err("must reject");
        assert!(matches!(
            err,
            TunnelError::InvalidState {
                operation: "connect",
                state: TunnelState::Unconfigured
            }
        ));
        assert!(provider.calls().is_empty());
        assert!(manager.handle().is_none());
    }

    #[tokio::test]
    async fn close_without_connect_is_a_noop() {
        let (mut manager, provider) = manager_with(FakeProvider::default());

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), TunnelState::Closed);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn blank_token_disables_tunnel_without_provider_calls() {
        let (mut manager, provider) = manager_with(FakeProvider::default());

        manager.authenticate("   ").await.expect("blank token is ok");
        assert_eq!(manager.state(), TunnelState::Disabled);

        let err = manager.connect(5000).await.expect_err("disabled");
        assert!(matches!(
            err,
            TunnelError::InvalidState {
                state: TunnelState::Disabled,
                ..
            }
        ));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn full_lifecycle_connects_then_tears_down_once() {
        let (mut manager, provider) = manager_with(FakeProvider::default());

        manager.authenticate(" tok ").await.expect("authenticate");
        let handle = manager.connect(5000).await.expect("connect").clone();
        assert_eq!(handle.public_url, "https://fake-5000.example");
        assert_eq!(handle.local_port, 5000);
        assert_eq!(manager.state(), TunnelState::Connected);
        assert_eq!(manager.public_url(), Some("https://fake-5000.example"));

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), TunnelState::Closed);
        assert!(manager.handle().is_none());
        assert_eq!(
            provider.calls(),
            vec![
                "authenticate:tok".to_string(),
                "open:5000".to_string(),
                "close_tunnel:https://fake-5000.example".to_string(),
                "shutdown".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn rejected_token_is_auth_error_and_stays_unconfigured() {
        let (mut manager, _provider) = manager_with(FakeProvider {
            reject_token: true,
            ..FakeProvider::default()
        });

        let err = manager.authenticate("bad").await.expect_err("rejected");
        assert!(matches!(err, TunnelError::Auth(_)));
        assert_eq!(manager.state(), TunnelState::Unconfigured);
    }

    #[tokio::test]
    async fn failed_connect_keeps_session_and_close_releases_it() {
        let (mut manager, provider) = manager_with(FakeProvider {
            fail_open: true,
            ..FakeProvider::default()
        });

        manager.authenticate("tok").await.expect("authenticate");
        let err = manager.connect(5000).await.expect_err("connect fails");
        assert!(matches!(err, TunnelError::Connect(_)));
        assert_eq!(manager.state(), TunnelState::Authenticated);

        manager.close().await;
        assert_eq!(
            provider.calls().last().map(String::as_str),
            Some("shutdown")
        );
    }

    #[tokio::test]
    async fn closed_manager_cannot_be_reused() {
        let (mut manager, _provider) = manager_with(FakeProvider::default());
        manager.close().await;

        let err = manager.authenticate("tok").await.expect_err("closed");
        assert!(matches!(
            err,
            TunnelError::InvalidState {
                operation: "authenticate",
                state: TunnelState::Closed
            }
        ));
    }
}
