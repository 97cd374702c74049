use crate::http::Status;
use crate::router::HandlerPos;
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for the dispatcher and everything around it
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    #[error("Request too large: {0} bytes")]
    RequestTooLarge(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Handler(String),

    #[error("Handler panicked: {0}")]
    Panic(String),

    #[error("Response already sent by {}; second write from {}", Writer(.first), Writer(.second))]
    DoubleResponse {
        first: Option<HandlerPos>,
        second: Option<HandlerPos>,
    },

    #[error("Cannot set header {name} after the response was sent")]
    HeadersSent { name: String },
}

impl ServerError {
    /// Status an error handler should render for this error
    pub fn status(&self) -> Status {
        match self {
            ServerError::HttpParse(_) | ServerError::BadRequest(_) | ServerError::Json(_) => {
                Status::BadRequest
            }
            ServerError::RequestTooLarge(_) => Status::PayloadTooLarge,
            ServerError::Unauthorized(_) => Status::Unauthorized,
            ServerError::NotFound(_) => Status::NotFound,
            _ => Status::InternalServerError,
        }
    }

    /// Whether this error points at a bug in how handlers were composed
    pub fn is_composition_defect(&self) -> bool {
        matches!(
            self,
            ServerError::DoubleResponse { .. } | ServerError::HeadersSent { .. }
        )
    }
}

impl Clone for ServerError {
    fn clone(&self) -> Self {
        match self {
            ServerError::Io(e) => ServerError::Io(io::Error::new(e.kind(), e.to_string())),
            ServerError::Json(e) => ServerError::BadRequest(e.to_string()),
            ServerError::HttpParse(m) => ServerError::HttpParse(m.clone()),
            ServerError::RequestTooLarge(n) => ServerError::RequestTooLarge(*n),
            ServerError::Config(m) => ServerError::Config(m.clone()),
            ServerError::Store(m) => ServerError::Store(m.clone()),
            ServerError::Pool(m) => ServerError::Pool(m.clone()),
            ServerError::BadRequest(m) => ServerError::BadRequest(m.clone()),
            ServerError::Unauthorized(m) => ServerError::Unauthorized(m.clone()),
            ServerError::NotFound(m) => ServerError::NotFound(m.clone()),
            ServerError::Handler(m) => ServerError::Handler(m.clone()),
            ServerError::Panic(m) => ServerError::Panic(m.clone()),
            ServerError::DoubleResponse { first, second } => ServerError::DoubleResponse {
                first: *first,
                second: *second,
            },
            ServerError::HeadersSent { name } => ServerError::HeadersSent { name: name.clone() },
        }
    }
}

struct Writer<'a>(&'a Option<HandlerPos>);

impl fmt::Display for Writer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(pos) => write!(f, "{}", pos),
            None => f.write_str("the dispatcher"),
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
