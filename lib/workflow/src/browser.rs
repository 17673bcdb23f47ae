//! Browser session abstraction consumed by actions.
//!
//! No concrete implementation lives in this crate; actions receive a
//! `&dyn BrowserSession` through [`crate::registry::RunContext`] and drive it
//! without this crate knowing which browser automation library backs it.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// Errors surfaced by a browser session implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    NavigationFailed { url: String, reason: String },
    ElementNotFound { selector: String },
    ScriptError { reason: String },
    SessionClosed,
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NavigationFailed { url, reason } => {
                write!(f, "navigation to '{url}' failed: {reason}")
            }
            Self::ElementNotFound { selector } => {
                write!(f, "element not found: {selector}")
            }
            Self::ScriptError { reason } => write!(f, "script error: {reason}"),
            Self::SessionClosed => write!(f, "browser session is closed"),
        }
    }
}

impl std::error::Error for BrowserError {}

/// A single browser automation session, scoped to one loop iteration of a
/// run. Actions drive navigation, element interaction, and script evaluation
/// through this trait; concrete automation is out of scope for this crate.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError>;
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError>;
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A no-op [`BrowserSession`] for tests and for actions that don't touch the
/// browser.
pub struct NullBrowserSession;

#[async_trait]
impl BrowserSession for NullBrowserSession {
    async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn click(&self, _selector: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, BrowserError> {
        Ok(Value::Null)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}
