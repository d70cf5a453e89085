use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IkatsError>;

#[derive(Error, Debug)]
pub enum IkatsError {
    /// Malformed caller arguments (checked locally) or HTTP 400.
    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Any other 4xx answer.
    #[error("Unexpected client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Server error: {0}")]
    Server(String),

    /// The backend answered, but the answer can't be interpreted.
    #[error("Malformed backend response: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IkatsError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Backend 5xx and unparsable backend answers belong to the same family.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server(_) | Self::Decode(_))
    }
}

/// Maps an HTTP status onto the error taxonomy. 2xx passes through.
pub fn check_http_code(status: StatusCode, context: &str) -> Result<()> {
    let code = status.as_u16();
    match code {
        200..=299 => Ok(()),
        400 => Err(IkatsError::Input(format!("{} (invalid parameters sent)", context))),
        404 => Err(IkatsError::NotFound(context.to_string())),
        409 => Err(IkatsError::Conflict(context.to_string())),
        401..=499 => Err(IkatsError::Client { status: code, message: context.to_string() }),
        500..=599 => Err(IkatsError::Server(format!("{} (got {})", context, code))),
        _ => Err(IkatsError::Server(format!("{} (unexpected status {})", context, code))),
    }
}
