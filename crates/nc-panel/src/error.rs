use std::fmt;

pub type PanelResult<T> = Result<T, PanelError>;

/// Errors surfaced by panel adapters.
///
/// `NotModified` is a sentinel, not a failure: the controller reuses its
/// cached value and must not log it as an error.
#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("{resource} not modified")]
    NotModified { resource: &'static str },

    #[error("request {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request {url} failed: status {status}, body: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("decode response from {url} failed: {detail}")]
    Decode { url: String, detail: String },

    #[error("{0}")]
    Invalid(String),
}

impl PanelError {
    pub fn not_modified(resource: &'static str) -> Self {
        Self::NotModified { resource }
    }

    pub fn is_not_modified(&self) -> bool {
        matches!(self, Self::NotModified { .. })
    }

    pub fn invalid(msg: impl fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }

    pub fn decode(url: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Decode {
            url: url.into(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_modified_is_sentinel() {
        let err = PanelError::not_modified("node");
        assert!(err.is_not_modified());
        assert_eq!(err.to_string(), "node not modified");
        assert!(!PanelError::invalid("server port must > 0").is_not_modified());
    }
}
