use thiserror::Error;

#[derive(Error, Debug)]
pub enum CymonidesError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Ontology error: {0}")]
    Ontology(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
