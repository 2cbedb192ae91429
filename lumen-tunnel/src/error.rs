use crate::manager::TunnelState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel auth error: {0}")]
    Auth(String),

    #[error("tunnel connect error: {0}")]
    Connect(String),

    #[error("invalid tunnel state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: TunnelState,
    },
}
