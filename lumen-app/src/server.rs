//! Gateway server lifecycle.
//!
//! Startup is an ordered routine with early return: configuration, model
//! client, optional tunnel, listener bind, serve. Shutdown closes the tunnel
//! before the listener stops accepting.

use crate::config::{Configuration, GatewayConfig, Secret};
use crate::routes;
use crate::routes::model::MODEL_ROUTE;
use anyhow::Result;
use axum::Extension;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use lumen_llm::{ModelClient, ModelRequest, TextGenerator};
use lumen_tunnel::{NgrokAgent, TunnelError, TunnelManager, TunnelState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Read-only per-process context shared by every request handler.
pub struct AppContext {
    pub config: Configuration,
    pub generator: Arc<dyn TextGenerator>,
    pub test_prompt: String,
}

pub async fn doctor(config_path: Option<PathBuf>, interactive: bool) -> Result<()> {
    let cfg = GatewayConfig::load(config_path, interactive).await?;
    let credentials = cfg.credentials();
    tracing::info!(
        bind_addr = %cfg.bind_addr()?,
        model = %cfg.model.model,
        model_base_url = %cfg.model.base_url,
        model_key_present = credentials.model_key.is_some(),
        tunnel_token_present = credentials.tunnel_token.is_some(),
        tunnel_required = cfg.tunnel.required,
        tunnel_agent_path = %cfg.tunnel.agent_path,
        "config ok"
    );
    if cfg.tunnel.required && credentials.tunnel_token.is_none() {
        return Err(anyhow::anyhow!(
            "tunnel.required is set but no tunnel token is configured"
        ));
    }
    Ok(())
}

pub async fn list_models(config_path: Option<PathBuf>, interactive: bool) -> Result<()> {
    let cfg = GatewayConfig::load(config_path, interactive).await?;
    let credentials = cfg.credentials();
    let key = require_model_key(&credentials)?;
    let client = ModelClient::new(cfg.model_client_config())?;

    let models = client.list_models(key.expose()).await?;
    if models.is_empty() {
        println!("no models available for this key");
        return Ok(());
    }
    println!("available models:");
    for model in &models {
        println!("- {}", model.name);
    }
    Ok(())
}

pub async fn probe(config_path: Option<PathBuf>, interactive: bool, prompt: &str) -> Result<()> {
    let cfg = GatewayConfig::load(config_path, interactive).await?;
    let credentials = cfg.credentials();
    let key = require_model_key(&credentials)?;
    let client = ModelClient::new(cfg.model_client_config())?;

    tracing::info!(model = %client.model(), "probing model");
    let response = client
        .generate(&ModelRequest::new(prompt), key.expose())
        .await?;
    println!("{}", response.text);
    println!("probe ok: {} is working", client.model());
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>, interactive: bool) -> Result<()> {
    let cfg = GatewayConfig::load(config_path, interactive).await?;
    let credentials = cfg.credentials();
    let addr = cfg.bind_addr()?;
    tracing::info!(
        bind_addr = %addr,
        model = %cfg.model.model,
        model_timeout_seconds = cfg.model.timeout_seconds,
        model_key_present = credentials.model_key.is_some(),
        tunnel_token_present = credentials.tunnel_token.is_some(),
        tunnel_required = cfg.tunnel.required,
        http_timeout_seconds = cfg.server.request_timeout_seconds,
        http_max_in_flight = cfg.server.max_in_flight,
        "server configuration loaded"
    );

    let generator: Arc<dyn TextGenerator> = Arc::new(ModelClient::new(cfg.model_client_config())?);

    let mut tunnel = TunnelManager::new(Arc::new(NgrokAgent::new(cfg.agent_config())?));
    start_tunnel(
        &mut tunnel,
        credentials.tunnel_token.as_ref(),
        cfg.server.port,
        cfg.tunnel.required,
    )
    .await?;
    let tunnel = Arc::new(Mutex::new(tunnel));

    let listener = match bind_listener(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tunnel.lock().await.close().await;
            return Err(e);
        }
    };
    println!("* Local URL: http://{addr}");

    let ctx = Arc::new(AppContext {
        config: credentials,
        generator,
        test_prompt: cfg.model.test_prompt.clone(),
    });
    let app = build_app(ctx, &cfg);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    run_server(listener, app, tunnel, shutdown).await
}

/// A tunnel failure is logged and the server continues locally, unless the
/// deployment requires the tunnel.
async fn start_tunnel(
    tunnel: &mut TunnelManager,
    token: Option<&Secret>,
    local_port: u16,
    required: bool,
) -> Result<()> {
    match establish_tunnel(tunnel, token, local_port).await {
        Ok(Some(public_url)) => {
            println!("* Public URL: {public_url}");
            println!("* Test model route: {public_url}{MODEL_ROUTE}");
            Ok(())
        }
        Ok(None) if required => Err(anyhow::anyhow!(
            "tunnel.required is set but no tunnel token was supplied"
        )),
        Ok(None) => {
            tracing::info!("serving without a public tunnel");
            Ok(())
        }
        Err(e) => {
            tunnel.close().await;
            if required {
                return Err(anyhow::anyhow!("required tunnel unavailable: {e}"));
            }
            tracing::warn!(error = %e, "public tunnel unavailable; serving locally only");
            Ok(())
        }
    }
}

async fn establish_tunnel(
    tunnel: &mut TunnelManager,
    token: Option<&Secret>,
    local_port: u16,
) -> std::result::Result<Option<String>, TunnelError> {
    tunnel
        .authenticate(token.map(Secret::expose).unwrap_or_default())
        .await?;
    if tunnel.state() != TunnelState::Authenticated {
        return Ok(None);
    }
    let handle = tunnel.connect(local_port).await?;
    Ok(Some(handle.public_url.clone()))
}

fn build_app(ctx: Arc<AppContext>, cfg: &GatewayConfig) -> axum::Router {
    // Request ids are set outside this layer, so the extension is present here.
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id = request
                .extensions()
                .get::<RequestId>()
                .and_then(|id| id.header_value().to_str().ok())
                .unwrap_or("-");
            tracing::info_span!(
                "request",
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id,
            )
        })
        .on_request(())
        .on_response(|response: &Response, latency: Duration, _span: &tracing::Span| {
            tracing::info!(
                status = response.status().as_u16(),
                latency_ms = latency.as_millis() as u64,
                "served"
            );
        })
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::warn!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(ctx))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.request_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn run_server(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    tunnel: Arc<Mutex<TunnelManager>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "lumen serving");

    let graceful_tunnel = tunnel.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            graceful_tunnel.lock().await.close().await;
        })
        .await;

    // No-op when the graceful path already closed it.
    tunnel.lock().await.close().await;
    served?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

async fn bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot listen on {addr}: {e}"))
}

fn require_model_key(credentials: &Configuration) -> Result<&Secret> {
    credentials.model_key.as_ref().ok_or_else(|| {
        anyhow::anyhow!("model API key not provided (set GEMINI_API_KEY or model.api_key)")
    })
}

/// Resolves on ctrl-c or SIGTERM, then cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "ctrl-c", "stopping gateway"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "stopping gateway"),
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lumen_llm::{LlmError, ModelResponse};
    use lumen_tunnel::{TunnelHandle, TunnelProvider};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingProvider {
        calls: StdMutex<Vec<String>>,
        reject_token: bool,
    }

    impl RecordingProvider {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl TunnelProvider for RecordingProvider {
        fn provider_id(&self) -> &str {
            "recording"
        }

        async fn authenticate(&self, _token: &str) -> lumen_tunnel::Result<()> {
            self.calls.lock().expect("calls lock").push("authenticate".to_string());
            if self.reject_token {
                return Err(TunnelError::Auth("bad token".to_string()));
            }
            Ok(())
        }

        async fn open(&self, local_port: u16) -> lumen_tunnel::Result<String> {
            self.calls.lock().expect("calls lock").push(format!("open:{local_port}"));
            Ok("https://abc.ngrok.example".to_string())
        }

        async fn close_tunnel(&self, _handle: &TunnelHandle) -> lumen_tunnel::Result<()> {
            self.calls.lock().expect("calls lock").push("close_tunnel".to_string());
            Ok(())
        }

        async fn shutdown(&self) -> lumen_tunnel::Result<()> {
            self.calls.lock().expect("calls lock").push("shutdown".to_string());
            Ok(())
        }
    }

    struct UnreachableModel;

    #[async_trait]
    impl TextGenerator for UnreachableModel {
        async fn generate(
            &self,
            _request: &ModelRequest,
            _key: &str,
        ) -> lumen_llm::Result<ModelResponse> {
            Err(LlmError::Invocation("model call timed out after 10ms".to_string()))
        }
    }

    fn manager(provider: &Arc<RecordingProvider>) -> TunnelManager {
        TunnelManager::new(provider.clone())
    }

    #[tokio::test]
    async fn blank_token_starts_without_tunnel() {
        let provider = Arc::new(RecordingProvider::default());
        let mut tunnel = manager(&provider);

        start_tunnel(&mut tunnel, None, 5000, false)
            .await
            .expect("optional tunnel");
        assert_eq!(tunnel.state(), TunnelState::Disabled);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn blank_token_is_fatal_when_tunnel_required() {
        let provider = Arc::new(RecordingProvider::default());
        let mut tunnel = manager(&provider);

        let err = start_tunnel(&mut tunnel, None, 5000, true)
            .await
            .expect_err("required tunnel");
        assert!(err.to_string().contains("tunnel.required"));
    }

    #[tokio::test]
    async fn tunnel_connects_to_local_port() {
        let provider = Arc::new(RecordingProvider::default());
        let mut tunnel = manager(&provider);
        let token = Secret::new("tok");

        start_tunnel(&mut tunnel, token.as_ref(), 5000, true)
            .await
            .expect("tunnel");
        assert_eq!(tunnel.state(), TunnelState::Connected);
        assert_eq!(tunnel.public_url(), Some("https://abc.ngrok.example"));
        assert_eq!(provider.calls(), vec!["authenticate", "open:5000"]);
    }

    #[tokio::test]
    async fn rejected_token_is_logged_unless_required() {
        let token = Secret::new("tok");

        let provider = Arc::new(RecordingProvider {
            reject_token: true,
            ..RecordingProvider::default()
        });
        let mut tunnel = manager(&provider);
        start_tunnel(&mut tunnel, token.as_ref(), 5000, false)
            .await
            .expect("optional tunnel failure is not fatal");
        assert_eq!(tunnel.state(), TunnelState::Closed);

        let mut tunnel = manager(&provider);
        let err = start_tunnel(&mut tunnel, token.as_ref(), 5000, true)
            .await
            .expect_err("required tunnel failure is fatal");
        assert!(err.to_string().contains("required tunnel unavailable"));
    }

    #[tokio::test]
    async fn served_gateway_answers_and_closes_tunnel_on_shutdown() {
        let provider = Arc::new(RecordingProvider::default());
        let mut tunnel = manager(&provider);
        let token = Secret::new("tok");
        start_tunnel(&mut tunnel, token.as_ref(), 5000, false)
            .await
            .expect("tunnel");
        let tunnel = Arc::new(Mutex::new(tunnel));

        let ctx = Arc::new(AppContext {
            config: Configuration {
                tunnel_token: token.clone(),
                model_key: Secret::new("key"),
            },
            generator: Arc::new(UnreachableModel),
            test_prompt: "hi".to_string(),
        });
        let app = build_app(ctx, &GatewayConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run_server(
            listener,
            app,
            tunnel.clone(),
            shutdown.clone(),
        ));

        let http = reqwest::Client::new();
        let root = http
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("root");
        assert_eq!(root.status(), reqwest::StatusCode::OK);
        assert!(root.headers().contains_key("x-request-id"));

        let model = http
            .post(format!("http://{addr}{MODEL_ROUTE}"))
            .send()
            .await
            .expect("model route");
        assert_eq!(model.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = model.json().await.expect("json");
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().is_some_and(|m| m.contains("timed out")));

        let root = http
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("root after failure");
        assert_eq!(root.status(), reqwest::StatusCode::OK);

        shutdown.cancel();
        server
            .await
            .expect("server task")
            .expect("server result");
        assert_eq!(tunnel.lock().await.state(), TunnelState::Closed);
        assert_eq!(
            provider.calls(),
            vec!["authenticate", "open:5000", "close_tunnel", "shutdown"]
        );
    }

    #[tokio::test]
    async fn blank_token_gateway_serves_locally_and_shuts_down_cleanly() {
        let provider = Arc::new(RecordingProvider::default());
        let mut tunnel = manager(&provider);
        start_tunnel(&mut tunnel, Secret::new("   ").as_ref(), 5000, false)
            .await
            .expect("optional tunnel");
        assert_eq!(tunnel.state(), TunnelState::Disabled);
        let tunnel = Arc::new(Mutex::new(tunnel));

        let ctx = Arc::new(AppContext {
            config: Configuration::default(),
            generator: Arc::new(UnreachableModel),
            test_prompt: "hi".to_string(),
        });
        let app = build_app(ctx, &GatewayConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(run_server(
            listener,
            app,
            tunnel.clone(),
            shutdown.clone(),
        ));

        let http = reqwest::Client::new();
        let root = http
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("root");
        assert_eq!(root.status(), reqwest::StatusCode::OK);
        assert_eq!(
            root.text().await.expect("root body"),
            crate::routes::home::ROOT_BANNER
        );

        let model = http
            .get(format!("http://{addr}{MODEL_ROUTE}"))
            .send()
            .await
            .expect("model route");
        assert_eq!(model.status(), reqwest::StatusCode::BAD_REQUEST);

        shutdown.cancel();
        server
            .await
            .expect("server task")
            .expect("server result");
        assert_eq!(tunnel.lock().await.state(), TunnelState::Closed);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = taken.local_addr().expect("addr");
        let err = bind_listener(addr).await.expect_err("port in use");
        assert!(err.to_string().contains("cannot listen on"));
    }

    #[test]
    fn model_commands_require_model_key() {
        let err = require_model_key(&Configuration::default()).expect_err("no key");
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}
