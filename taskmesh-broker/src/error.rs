use taskmesh_common::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("broker channel error: {0}")]
    Channel(String),
    #[error("failed to reconnect after exhausting retries")]
    ReconnectExhausted,
    #[error("message payload was not valid JSON: {0}")]
    InvalidPayload(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) | lapin::Error::ProtocolError(_) => {
                BrokerError::ConnectionLost(err.to_string())
            }
            other => BrokerError::Channel(other.to_string()),
        }
    }
}

impl SafeDisplay for BrokerError {
    fn to_safe_string(&self) -> String {
        match self {
            BrokerError::ConnectionLost(_) => "broker connection lost".to_string(),
            BrokerError::Channel(_) => "broker channel error".to_string(),
            BrokerError::ReconnectExhausted => "broker unreachable".to_string(),
            BrokerError::InvalidPayload(_) => "malformed task payload".to_string(),
        }
    }
}
