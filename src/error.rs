use thiserror::Error;

/// The input could not be read as a table.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("the file is not valid UTF-8 text")]
    Encoding,
    #[error("the file is empty")]
    Empty,
    #[error("could not determine the column delimiter")]
    Delimiter,
    #[error("malformed row at line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

/// The table does not have the columns the selected mode requires.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("required column '{column}' is missing")]
    MissingColumn { column: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Error while processing the CSV file, please check its format: {0}")]
    Parse(#[from] ParseError),
    #[error("The CSV file does not match the selected mode: {0}")]
    Schema(#[from] SchemaError),
    #[error("Invalid map style: {0}")]
    Style(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Output(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors caused by the submitted file or parameters rather than the host.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PipelineError::Parse(_) | PipelineError::Schema(_) | PipelineError::Style(_)
        )
    }
}
