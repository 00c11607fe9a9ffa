use thiserror::Error;

use crate::config::ConfigError;
use crate::exec::ExecError;
use crate::store::StoreError;
use crate::venue::VenueError;

/// Top-level error for library consumers embedding the core.
///
/// Internally each layer keeps its own typed error; this enum only exists so
/// callers can hold one error type across the seams.
#[derive(Debug, Error)]
pub enum ArbError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Venue(#[from] VenueError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ArbResult<T> = Result<T, ArbError>;
