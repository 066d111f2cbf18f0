use thiserror::Error;

/// Top-level error type for the Quantis engine.
#[derive(Debug, Error)]
pub enum QuantisError {
    /// Configuration missing/invalid. Fatal at startup; rejected-and-kept
    /// at runtime reload (see §7 of the spec).
    #[error("config error: {0}")]
    Config(String),

    /// NaN/Inf, non-SPD covariance, or other numerical fault in the HMM
    /// updater. Callers revert to the last-known-good parameters.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A bounded channel between pipeline stages is full or closed.
    #[error("channel error: {0}")]
    Channel(String),

    /// A signal sink failed to publish.
    #[error("sink error: {0}")]
    Sink(String),

    /// I/O error (config file, checkpoint file, replay log).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error (signals, checkpoints).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error (configuration file).
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let e = QuantisError::Numerical("non-SPD covariance for regime 2".into());
        assert_eq!(
            e.to_string(),
            "numerical error: non-SPD covariance for regime 2"
        );
    }
}
