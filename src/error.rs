use rusb::Error as USBError;
use thiserror::Error;

/// Errors that end a session. Frame and channel level problems are absorbed
/// by the session and never show up here.
#[derive(Error, Debug)]
pub enum AntError {
    #[error("transport fault: {0}")]
    Transport(#[from] USBError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("radio did not answer command 0x{0:02X}")]
    RadioUnresponsive(u8),

    #[error("output stream closed: {0}")]
    Output(#[from] std::io::Error),

    #[error("cannot install stop handler: {0}")]
    StopHandler(#[from] ctrlc::Error),
}

impl AntError {
    /// True when the error came from the USB transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, AntError::Transport(_) | AntError::RadioUnresponsive(_))
    }
}

impl From<serde_json::Error> for AntError {
    fn from(e: serde_json::Error) -> Self {
        AntError::Configuration(e.to_string())
    }
}
