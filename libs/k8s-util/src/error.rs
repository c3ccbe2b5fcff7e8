use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}: {1}")]
    // reqwest errors carry the whole request context, keep them off the stack
    HttpError(String, #[source] Box<reqwest::Error>),

    #[error("{0}")]
    MissingData(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    UrlParseError(String, #[source] url::ParseError),
}

impl Error {
    /// True when the API server answered `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(_, e) if is_kube_not_found(e))
    }
}

/// True when the API server answered `404 Not Found`.
#[inline]
pub fn is_kube_not_found(error: &kube::Error) -> bool {
    is_kube_status(error, 404)
}

/// True when the API server answered `409 Conflict` for a create (`AlreadyExists`).
#[inline]
pub fn is_kube_already_exists(error: &kube::Error) -> bool {
    matches!(
        error,
        kube::Error::Api(status) if status.code == 409 && status.reason == "AlreadyExists"
    )
}

#[inline]
fn is_kube_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(status) if status.code == code)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
