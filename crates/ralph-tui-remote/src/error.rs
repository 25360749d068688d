//! Error kinds surfaced by the remote control server. Grounded on the core
//! crate's `EngineError`/`SessionError` thiserror enums.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to bind to any port in range {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] ralph_tui_core::error::EngineError),

    #[error("config error: {0}")]
    Config(String),

    #[error("orchestration error: {0}")]
    Orchestration(String),
}
