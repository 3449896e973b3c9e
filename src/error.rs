use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtomError {
    #[error("expecting {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("arguments fail to match variable declarations")]
    TypeCheck,
    #[error("fuzzy type restrictions are not implemented")]
    FuzzyTypeUnimplemented,
    #[error("storage holds a type unknown to this process: {0}")]
    UnknownType(String),
    #[error("node name of {0} bytes exceeds the storable maximum of 2700")]
    NameTooLong(usize),
    #[error("link arity {0} exceeds the storable maximum of 330")]
    LinkTooWide(usize),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, AtomError>;

// Helper conversions
impl From<rusqlite::Error> for AtomError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
