use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("lease for {key} was lost or is owned by another holder")]
    LeaseLost { key: crate::LeaseKey },

    #[error("lease object {key} still missing after creation")]
    LeaseUnavailable { key: crate::LeaseKey },

    #[error("invalid mutex settings: {0}")]
    InvalidSettings(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
