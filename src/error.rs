use thiserror::Error;

/// Errors surfaced by the chat engine.
///
/// `Api` covers everything that went wrong while talking to the remote
/// endpoint (transport failures, non-2xx statuses, an `error` body, bad
/// stream data); everything else is a problem on our side of the wire.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure or an error reported by the completions API.
    #[error("{message}")]
    Api { message: String },

    /// Failure while interpreting an otherwise successful response.
    #[error("{message}")]
    App { message: String },

    /// A persistence operation failed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// A send was rejected because a turn is already in flight.
    #[error("a turn is already in flight")]
    Busy,

    /// No API settings have been configured yet.
    #[error("no API settings configured")]
    NotConfigured,

    /// A tool import payload failed validation; nothing was changed.
    #[error("invalid tool import: {0}")]
    InvalidImport(String),
}

impl Error {
    pub fn api(message: impl Into<String>) -> Self {
        Error::Api {
            message: message.into(),
        }
    }

    pub fn app(message: impl Into<String>) -> Self {
        Error::App {
            message: message.into(),
        }
    }

    /// Renders the error the way it appears as an inline chat entry.
    pub fn chat_text(&self) -> String {
        match self {
            Error::Api { message } => format!("❌ API: {message}"),
            other => format!("❌ App: {other}"),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Storage(err)
    }
}
