//! Error types for configuration, login and portal operations

use std::fmt;

/// Errors raised while loading configuration or secrets
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    Io(std::io::Error),

    /// The configuration file is not valid JSON for [`crate::config::Config`]
    Invalid(String),

    /// A required secret is missing from the environment
    MissingSecret(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read configuration file: {}", err),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration file: {}", msg),
            ConfigError::MissingSecret(name) => {
                write!(f, "required secret {} is not set in the environment", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Failures a login call surfaces to its caller
///
/// Captcha rejections and unmatched verification codes never show up here, the
/// login state machine retries those internally.
#[derive(Debug)]
pub enum LoginError {
    /// Login id or password is not configured
    MissingCredentials,

    /// The portal answered with a shape the state machine does not know
    Protocol(String),

    /// No verification code arrived before the deadline
    CodeTimeout,

    /// An HTTP call to the portal failed or timed out
    Transport(String),

    /// Shutdown was requested while the login was waiting
    Cancelled,
}

impl fmt::Display for LoginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginError::MissingCredentials => {
                write!(f, "UNION_LOGIN_ID / UNION_LOGIN_PWD not set in environment")
            }
            LoginError::Protocol(msg) => write!(f, "unexpected login response: {}", msg),
            LoginError::CodeTimeout => write!(f, "no verification code received in time"),
            LoginError::Transport(msg) => write!(f, "login request failed: {}", msg),
            LoginError::Cancelled => write!(f, "login cancelled by shutdown"),
        }
    }
}

impl std::error::Error for LoginError {}

impl From<reqwest::Error> for LoginError {
    fn from(err: reqwest::Error) -> Self {
        LoginError::Transport(err.to_string())
    }
}

/// Errors of the portal data endpoints
#[derive(Debug)]
pub enum PortalError {
    /// The request could not be sent or the body could not be read
    Transport(String),

    /// The portal answered with a non-success status code
    Status(u16),

    /// The session credential was rejected
    Unauthorized,

    /// The body is not the expected JSON shape
    Shape(String),
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalError::Transport(msg) => write!(f, "portal request failed: {}", msg),
            PortalError::Status(code) => write!(f, "portal returned HTTP {}", code),
            PortalError::Unauthorized => write!(f, "portal rejected the session credential"),
            PortalError::Shape(msg) => write!(f, "unexpected portal response: {}", msg),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<reqwest::Error> for PortalError {
    fn from(err: reqwest::Error) -> Self {
        PortalError::Transport(err.to_string())
    }
}

/// Truncates a response body for error messages.
pub(crate) fn excerpt(body: &str, max_chars: usize) -> String {
    let mut out: String = body.chars().take(max_chars).collect();
    if body.chars().count() > max_chars {
        out.push('…');
    }
    out
}
