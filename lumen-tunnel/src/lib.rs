//! Optional public ingress for a locally bound gateway.
//!
//! The manager owns the tunnel lifecycle; providers are pure I/O against the
//! tunnel service.

mod error;
mod manager;
mod ngrok;
mod provider;

pub use error::{Result, TunnelError};
pub use manager::{TunnelHandle, TunnelManager, TunnelState};
pub use ngrok::{AgentApi, AgentTunnel, NgrokAgent, NgrokAgentConfig};
pub use provider::TunnelProvider;
