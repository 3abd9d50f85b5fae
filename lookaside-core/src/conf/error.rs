use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to deserialize policy config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field:{field} error:{reason}")]
    Field { field: String, reason: String },

    #[error("{}", render(.0))]
    Multiple(Vec<ConfigError>),
}

impl ConfigError {
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Field {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapses a list of errors: none means success, one is returned
    /// as-is, several are aggregated.
    pub fn from_list(mut errors: Vec<ConfigError>) -> Result<(), ConfigError> {
        if errors.is_empty() {
            return Ok(());
        }
        if errors.len() == 1 {
            return Err(errors.remove(0));
        }
        Err(ConfigError::Multiple(errors))
    }
}

fn render(errors: &[ConfigError]) -> String {
    let rendered: Vec<String> = errors.iter().map(ConfigError::to_string).collect();
    format!("errors parsing policy config: [{}]", rendered.join("; "))
}
