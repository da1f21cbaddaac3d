use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown entity kind `{tag}`")]
    UnknownKind { tag: String },
}

impl DomainError {
    pub fn unknown_kind(tag: impl Into<String>) -> Self {
        Self::UnknownKind { tag: tag.into() }
    }
}
