use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Push channel authentication rejected")]
    AuthRejected,

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid push URL: {0}")]
    InvalidUrl(String),
}

impl ChannelError {
    /// Terminal errors stop the reconnect loop; everything else is retried
    /// on the backoff schedule.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelError::AuthRejected | ChannelError::InvalidUrl(_))
    }
}
