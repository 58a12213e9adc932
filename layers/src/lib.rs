//! Protocol Stack Layers Library
//!
//! This crate implements the 5G NR Radio Link Control layer according to
//! 3GPP TS 38.322 (Release 16).

pub mod rlc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use rlc::RlcError;

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Layer not initialized")]
    NotInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("RLC error: {0}")]
    Rlc(#[from] RlcError),
}

/// Common trait for all protocol layers
#[async_trait]
pub trait ProtocolLayer: Send + Sync {
    /// Initialize the layer
    async fn initialize(&mut self) -> Result<(), LayerError>;

    /// Process incoming data from lower layer
    async fn process_uplink(&mut self, data: Bytes) -> Result<(), LayerError>;

    /// Process outgoing data from upper layer
    async fn process_downlink(&mut self, data: Bytes) -> Result<(), LayerError>;

    /// Shutdown the layer
    async fn shutdown(&mut self) -> Result<(), LayerError>;
}
