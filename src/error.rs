use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgroRiskError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown rule type '{func}' in {spec}")]
    UnknownRuleType { func: String, spec: String },

    #[error("Column name collision: '{0}' is already present in the table")]
    ColumnCollision(String),

    #[error("Complex value produced by '{expression}' at row {row}")]
    ComplexValue { expression: String, row: usize },

    #[error("Data format error: {0}")]
    DataFormat(String),

    #[error("Cannot update immutable variable '{0}'")]
    ImmutableUpdate(String),

    #[error("Variable '{0}' already exists")]
    DuplicateKey(String),

    #[error("Variable '{0}' not found")]
    MissingKey(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AgroRiskError>;
