use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred parsing the file")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to serialize the statistics document")]
    Stats(#[from] serde_yaml::Error),

    #[error("the merge was cancelled")]
    Cancelled,

    #[error("stale run files found in {0}, pass --resume to continue or --force-resume to start over")]
    StaleSpill(PathBuf),

    #[error("{refused} of {total} sources were refused")]
    PartialFailure { refused: usize, total: usize },

    #[error("{count} edges reference an id that is not present in the merged nodes")]
    DanglingReferences { count: u64 },
}

impl Error {
    /// The process exit code reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Cancelled => 2,
            Error::Io(err) if is_out_of_space(err) => 3,
            Error::PartialFailure { .. } => 4,
            _ => 1,
        }
    }
}

fn is_out_of_space(err: &std::io::Error) -> bool {
    // StorageFull is unstable on some platforms so fall back to the raw errno
    matches!(err.raw_os_error(), Some(28) | Some(122))
}


#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("no such chain in the configuration: {0}")]
    UnknownChain(String),

    #[error("chain {0} declares no steps")]
    EmptyChain(String),

    #[error("chain {0} expects exactly two output columns")]
    ChainColumns(String),

    #[error("invalid --only argument: {0}")]
    InvalidOnly(String),
}


#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("{path}: missing required column {column}")]
    MissingColumn { path: String, column: String },

    #[error("{path}: could not read the file header")]
    UnreadableHeader { path: String },
}
