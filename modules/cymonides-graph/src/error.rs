use thiserror::Error;

use cymonides_common::CymonidesError;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] CymonidesError),
}

impl GraphError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GraphError::Store(e) if e.is_fatal())
    }
}
