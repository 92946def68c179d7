use config::ConfigError;
use thiserror::Error;

use crate::selector::SelectorError;

#[derive(Error, Debug)]
pub enum BrokerError {
    /// The caller violated a precondition; retrying the same call will fail again.
    #[error("validation error, {0}")]
    Validation(String),
    #[error("not found, {0}")]
    NotFound(String),
    #[error("not authorized, {0}")]
    Authorization(String),
    #[error("internal error, {0}")]
    Internal(String),
    #[error("selector error, {0}")]
    Selector(SelectorError),
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Config(ConfigError),
}

impl BrokerError {
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        BrokerError::Validation(msg.into())
    }

    #[inline]
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        BrokerError::Internal(msg.into())
    }

    #[inline]
    pub fn is_validation(&self) -> bool {
        matches!(self, BrokerError::Validation(_) | BrokerError::Selector(_))
    }

    #[inline]
    pub fn is_authorization(&self) -> bool {
        matches!(self, BrokerError::Authorization(_))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, BrokerError::Internal(_) | BrokerError::Anyhow(_))
    }
}

impl From<SelectorError> for BrokerError {
    #[inline]
    fn from(e: SelectorError) -> Self {
        BrokerError::Selector(e)
    }
}

impl From<anyhow::Error> for BrokerError {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        BrokerError::Anyhow(e)
    }
}

impl From<ConfigError> for BrokerError {
    #[inline]
    fn from(e: ConfigError) -> Self {
        BrokerError::Config(e)
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
