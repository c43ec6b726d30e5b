use thiserror::Error;

/// Crate-wide error type.
///
/// Transport variants carry the wire error string; configuration errors
/// carry the offending key path so startup failures point at the document.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Configuration(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("modbus read error: {0}")]
    TransportRead(String),
    #[error("modbus write error: {0}")]
    TransportWrite(String),
    #[error("modbus context error: {0}")]
    TransportContext(String),
    #[error("mqtt error: {0}")]
    Mqtt(String),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
