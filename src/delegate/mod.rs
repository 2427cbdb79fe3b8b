//! Per-request policy hooks.
//!
//! A [`Delegate`] answers four questions for the orchestrator: may this
//! request proceed before any I/O, may it proceed once the source is known,
//! should an overlay be drawn, and which regions must be redacted.
//! Authorization outcomes are plain data ([`AuthOutcome`]); the orchestrator
//! turns them into errors or a scale constraint.

mod signed;

use async_trait::async_trait;

use crate::error::ImageError;
use crate::operation::{Dimension, Identifier, Overlay, Rectangle, ScaleConstraint};
use crate::source::StatResult;

pub use signed::{SignatureError, SignedUrlDelegate, UrlSigner};

// =============================================================================
// Context
// =============================================================================

/// What the HTTP layer knows about the client request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    /// Request path as received (percent-encoded).
    pub path: String,
    /// Decoded query parameters in request order.
    pub query: Vec<(String, String)>,
    /// Internal requests (cache pre-warming) skip authorization.
    pub trusted: bool,
}

impl ClientContext {
    pub fn new(path: impl Into<String>, query: Vec<(String, String)>) -> Self {
        Self {
            path: path.into(),
            query,
            trusted: false,
        }
    }

    /// Context for requests issued by the server itself.
    pub fn internal() -> Self {
        Self {
            trusted: true,
            ..Self::default()
        }
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Everything a delegate may base its decisions on.
///
/// Fields become available as the request progresses: `stat` after the
/// source is checked, `full_size` and `resulting_size` once `Info` is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateContext {
    pub identifier: Identifier,
    pub client: ClientContext,
    pub stat: Option<StatResult>,
    /// Upright full size of the source.
    pub full_size: Option<Dimension>,
    /// Size of the image that will be returned.
    pub resulting_size: Option<Dimension>,
}

impl DelegateContext {
    pub fn new(identifier: Identifier, client: ClientContext) -> Self {
        Self {
            identifier,
            client,
            stat: None,
            full_size: None,
            resulting_size: None,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of an authorization phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow,
    Deny,
    /// Deny pending authentication; the string is a `WWW-Authenticate` value.
    Challenge(String),
    Redirect {
        location: String,
        status: u16,
    },
    /// Allow, but serve the source as if it were reduced by this constraint.
    ScaleConstrained(ScaleConstraint),
}

impl AuthOutcome {
    /// Interpret the outcome. `Ok(Some(_))` carries a constraint to apply.
    pub fn into_result(self) -> Result<Option<ScaleConstraint>, ImageError> {
        match self {
            AuthOutcome::Allow => Ok(None),
            AuthOutcome::ScaleConstrained(constraint) => Ok(Some(constraint)),
            AuthOutcome::Deny => Err(ImageError::forbidden("Access denied")),
            AuthOutcome::Challenge(challenge) => Err(ImageError::Unauthorized { challenge }),
            AuthOutcome::Redirect { location, status } => {
                Err(ImageError::Redirect { location, status })
            }
        }
    }
}

// =============================================================================
// Delegate
// =============================================================================

/// Request policy hooks. Every method has a permissive default.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Called before any source I/O.
    async fn authorize_before_access(&self, _ctx: &DelegateContext) -> AuthOutcome {
        AuthOutcome::Allow
    }

    /// Called once the source has been checked.
    async fn authorize(&self, _ctx: &DelegateContext) -> AuthOutcome {
        AuthOutcome::Allow
    }

    /// Overlay to draw on this request's output, if any.
    async fn overlay(&self, _ctx: &DelegateContext) -> Option<Overlay> {
        None
    }

    /// Regions to blank out, in upright full-image coordinates.
    async fn redactions(&self, _ctx: &DelegateContext) -> Vec<Rectangle> {
        Vec::new()
    }
}

/// Allows everything; no overlays or redactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDelegate;

impl Delegate for DefaultDelegate {}
