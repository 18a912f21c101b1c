//! Errors surfaced to transports, with their acknowledgement status.

use thiserror::Error;

use crate::directory::StoreError;
use crate::registry::TransportError;
use crate::router::RouterError;
use crate::tree::TreeError;

/// Errors surfaced by the [`crate::Hub`].
#[derive(Debug, Error)]
pub enum HubError {
    /// Bad credentials on connect.
    #[error("Authentication failed for {0}")]
    Authentication(String),

    /// Malformed or unknown request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Topic not found.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// No access to the topic.
    #[error("No access to topic {0}")]
    Forbidden(String),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HubError {
    /// HTTP-style status for acknowledgements.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            HubError::Authentication(_) | HubError::Forbidden(_) => 403,
            HubError::BadRequest(_) => 400,
            HubError::TopicNotFound(_) => 404,
            HubError::Router(e) => e.status(),
            HubError::Tree(_) | HubError::Store(_) | HubError::Transport(_) => 500,
        }
    }

    /// Short name of the error kind, for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Authentication(_) => "authentication",
            HubError::BadRequest(_) => "bad_request",
            HubError::TopicNotFound(_) => "not_found",
            HubError::Forbidden(_) => "forbidden",
            HubError::Router(RouterError::AlreadySubscribed(_)) => "conflict",
            HubError::Router(_) => "router",
            HubError::Tree(_) => "tree",
            HubError::Store(_) => "store",
            HubError::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(HubError::Authentication("x".into()).status(), 403);
        assert_eq!(HubError::BadRequest("x".into()).status(), 400);
        assert_eq!(HubError::from(RouterError::AlreadySubscribed("/t".into())).status(), 409);
        assert_eq!(HubError::from(RouterError::TopicNotFound("/t".into())).status(), 404);
        assert_eq!(
            HubError::from(TreeError::CycleDetected { rounds: 25, ids: vec![] }).status(),
            500
        );
    }
}
