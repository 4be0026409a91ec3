use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("frame too large: length is {len} cap is {cap}")]
    Oversize { len: usize, cap: usize },
    #[error("connection closed")]
    Closed,
    #[error("protocol violation:{0}")]
    Protocol(String),
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
