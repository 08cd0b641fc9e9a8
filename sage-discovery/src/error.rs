use sage_core::{AddressParseError, Attempt, FailureKind};
use std::time::Duration;
use thiserror::Error;

/// Discovery and request errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("request to {url} timed out after {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },

    #[error("{url} answered but is not a SAGE backend: {reason}")]
    AuthenticityMismatch { url: String, reason: String },

    #[error("backend at {url} is up but not ready (status '{status}')")]
    NotReady { url: String, status: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Application {
        url: String,
        status: u16,
        body: String,
    },

    #[error("no SAGE backend found after trying {} address(es)", .attempts.len())]
    ExhaustedCandidates { attempts: Vec<Attempt> },

    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("invalid backend address: {0}")]
    InvalidUrl(#[from] AddressParseError),

    #[error("failed to build request: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, Error>;

const LOADING: &str = "The assistant is still loading or busy. Wait a moment and try again.";
const WRONG_SERVICE: &str = "A different program is using the SAGE port. Close it, or restart the SAGE launcher so it can reclaim the port.";

impl Error {
    /// Errors that mean "no usable connection at this address", as opposed to
    /// a real answer from the backend. Only these trigger rediscovery.
    pub fn is_connection_class(&self) -> bool {
        matches!(self, Error::Unreachable { .. } | Error::Timeout { .. })
    }

    /// Plain-language hint for end users, who have no other way to tell a
    /// slow backend from a missing one or a port collision.
    ///
    /// A failed sweep is judged by its attempts: a foreign service on any
    /// candidate beats a slow one, which beats nothing answering at all.
    pub fn guidance(&self) -> &'static str {
        match self {
            Error::Timeout { .. } | Error::NotReady { .. } => LOADING,
            Error::Unreachable { .. } => {
                "Nothing answered at this address. Make sure the SAGE launcher is running."
            }
            Error::ExhaustedCandidates { attempts } => {
                if attempts.iter().any(|a| a.failed_with(FailureKind::NotOurs)) {
                    WRONG_SERVICE
                } else if attempts
                    .iter()
                    .any(|a| a.failed_with(FailureKind::Timeout) || a.failed_with(FailureKind::NotReady))
                {
                    LOADING
                } else {
                    "No SAGE backend was found on this computer. Start it from the SAGE launcher, then try again."
                }
            }
            Error::AuthenticityMismatch { .. } => WRONG_SERVICE,
            Error::Application { .. } => "The assistant reported an error while handling the request.",
            Error::Decode { .. } => {
                "The assistant sent a response this version does not understand. Check that launcher and backend versions match."
            }
            Error::InvalidUrl(_) | Error::Request(_) => {
                "The backend address is misconfigured. Check SAGE_BACKEND_URL."
            }
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Error::Timeout {
                url: url.to_string(),
                after: timeout,
            }
        } else if err.is_builder() {
            Error::Request(error_chain(&err))
        } else if err.is_decode() {
            Error::Decode {
                url: url.to_string(),
                reason: error_chain(&err),
            }
        } else {
            Error::Unreachable {
                url: url.to_string(),
                reason: error_chain(&err),
            }
        }
    }
}

/// `reqwest` hides the useful part ("connection refused") in the source chain.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
