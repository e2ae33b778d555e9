use thiserror::Error;

// Fatal configuration problems. Everything else (I/O, parse errors) goes
// through anyhow and terminates the run the same way.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot find input file '{0}'")]
    MissingInput(String),

    #[error("Output directory '{0}' does not exist")]
    MissingOutputDir(String),

    #[error("Column '{column}' not found in '{file}' (header: {header})")]
    MissingColumn {
        column: String,
        file: String,
        header: String,
    },

    #[error("Number of factors in prior file '{file}' ({found}) does not match --n-factor ({expected})")]
    PriorFactorMismatch {
        file: String,
        found: usize,
        expected: usize,
    },

    #[error("Model file '{0}' is missing or not a readable model")]
    MissingModel(String),

    #[error("Unable to derive a feature vocabulary: {0}")]
    EmptyVocabulary(String),

    #[error("Too few hexagons ({0}) to fit a density model")]
    TooFewCells(usize),

    #[error("Invalid argument --{arg}: {reason}")]
    InvalidArgument { arg: &'static str, reason: String },
}
