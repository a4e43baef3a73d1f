//! Tagged classifier results.
//!
//! Classifiers never raise to the turn pipeline. A failed or unparseable
//! classification still yields a structurally valid value, tagged `Degraded`
//! with the reason so callers can decide whether to persist or trust it.

#[derive(Debug, Clone, PartialEq)]
pub enum Classification<T> {
    Ok(T),
    Degraded { value: T, reason: String },
}

impl<T> Classification<T> {
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self::Degraded {
            value,
            reason: reason.into(),
        }
    }

    /// Collapse a fallible classifier call, substituting `fallback` on error.
    pub fn from_result(result: anyhow::Result<T>, fallback: impl FnOnce() -> T) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::degraded(fallback(), format!("{:#}", error)),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Ok(value) | Self::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::Degraded { reason, .. } => Some(reason),
        }
    }
}
