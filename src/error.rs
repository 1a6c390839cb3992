use thiserror::Error;

use crate::crypto::CryptoError;
use crate::db::DatabaseError;
use crate::engine::EngineError;
use crate::log::LogError;
use crate::meta::MetaError;
use crate::model::ModelError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical module errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
