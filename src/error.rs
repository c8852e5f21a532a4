//! Crate-level error type the pipeline surfaces to callers.

use crate::android::container::ContainerError;
use crate::dex::error::DexError;
use crate::signer::SignError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("dex error in {entry}: {source}")]
    Dex { entry: String, source: DexError },

    #[error("signing error: {0}")]
    Signing(#[from] SignError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;
