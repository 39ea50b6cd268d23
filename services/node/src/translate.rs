//! Translation backend seam.
//!
//! The node treats translation as a synchronous, pluggable function; the
//! production backend (an external service) lives outside this crate.  The
//! adapter rule is fixed: if the backend fails, the original text passes
//! through unchanged so delivery never blocks on translation.

use cm_protocol::Language;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A translation service: text in, translated text out.
pub trait TranslationBackend: Send + Sync {
    fn translate(&self, text: &str, target: Language) -> Result<String, TranslateError>;
}

/// Default backend: returns the input unchanged.  Stands in wherever no
/// real translation service is wired up.
#[derive(Debug, Default)]
pub struct PassthroughBackend;

impl TranslationBackend for PassthroughBackend {
    fn translate(&self, text: &str, _target: Language) -> Result<String, TranslateError> {
        Ok(text.to_owned())
    }
}

/// Apply the fill-or-fallback rule: translate `text`, falling back to the
/// original on backend failure.
pub fn translate_or_original(
    backend: &dyn TranslationBackend,
    text: &str,
    target: Language,
) -> String {
    match backend.translate(text, target) {
        Ok(translated) => translated,
        Err(e) => {
            warn!(error = %e, "translation backend failed, passing original text through");
            text.to_owned()
        }
    }
}
