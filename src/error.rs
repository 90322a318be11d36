//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("startup error: {0}")]
    Startup(String),

    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while the router task handles messages.
#[derive(Debug, Error)]
pub enum HubError {
    /// The distributed protocol is desynchronised; never recovered.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl HubError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HubError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn session_error_display() {
        let e = AppError::Session("bad connect string".into());
        assert!(e.to_string().contains("bad connect string"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(HubError::Protocol("second barrier".into()).is_fatal());
        assert!(!HubError::Process("launch failed".into()).is_fatal());
        let app: AppError = HubError::Codec("bad line".into()).into();
        assert!(app.to_string().contains("bad line"));
    }
}
