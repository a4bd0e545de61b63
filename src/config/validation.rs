//! Configuration validation logic.

use crate::errors::Error;

use super::Config;

const MAX_SEARCH_LIMIT: usize = 10_000;
const MAX_EXTRACTION_WORKERS: usize = 64;

/// Validates configuration values.
pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Validate all configuration values for correctness and constraints.
    ///
    /// Checks that:
    /// - Database path, embedding model and user id are not empty
    /// - Search limit is between 1 and 10,000
    /// - RRF k is positive and the fusion weights are non-negative
    /// - At least one extraction worker and one buffered record are allowed
    /// - No NaN or infinite values
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any validation check fails.
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_database_path()?;
        self.validate_embedding_model()?;
        self.validate_user_id()?;
        self.validate_search_limit()?;
        self.validate_rrf()?;
        self.validate_workers()?;

        Ok(())
    }

    fn validate_database_path(&self) -> Result<(), Error> {
        if self.config.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        Ok(())
    }

    fn validate_embedding_model(&self) -> Result<(), Error> {
        if self.config.embedding_model.trim().is_empty() {
            return Err(Error::Config("Embedding model cannot be empty".to_string()));
        }

        Ok(())
    }

    fn validate_user_id(&self) -> Result<(), Error> {
        if self.config.user_id.trim().is_empty() {
            return Err(Error::Config("User id cannot be empty".to_string()));
        }

        Ok(())
    }

    fn validate_search_limit(&self) -> Result<(), Error> {
        let limit = self.config.search_limit;
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(Error::Config(format!(
                "Invalid search limit: {limit} (must be between 1 and {MAX_SEARCH_LIMIT})"
            )));
        }

        Ok(())
    }

    fn validate_rrf(&self) -> Result<(), Error> {
        let k = self.config.rrf_k;
        if !k.is_finite() || k <= 0.0 {
            return Err(Error::Config(format!(
                "Invalid RRF k: {k} (must be a positive finite number)"
            )));
        }

        for (name, weight) in [
            ("keyword weight", self.config.keyword_weight),
            ("vector weight", self.config.vector_weight),
        ] {
            if !weight.is_finite() {
                return Err(Error::Config(format!(
                    "Invalid {name}: NaN and infinity are not allowed"
                )));
            }
            if weight < 0.0 {
                return Err(Error::Config(format!(
                    "Invalid {name}: {weight} (must not be negative)"
                )));
            }
        }

        Ok(())
    }

    fn validate_workers(&self) -> Result<(), Error> {
        let workers = self.config.extraction_workers;
        if workers == 0 || workers > MAX_EXTRACTION_WORKERS {
            return Err(Error::Config(format!(
                "Invalid extraction workers: {workers} (must be between 1 and {MAX_EXTRACTION_WORKERS})"
            )));
        }

        if self.config.max_buffered_records == 0 {
            return Err(Error::Config(
                "Max buffered records must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn check(config: &Config) -> Result<(), Error> {
        ConfigValidator::new(config).validate()
    }

    #[test]
    fn test_default_is_valid() {
        assert!(check(&Config::default()).is_ok());
    }

    #[test]
    fn test_empty_database_path_rejected() {
        let config = Config {
            database_path: PathBuf::new(),
            ..Config::default()
        };
        assert!(matches!(check(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_blank_user_rejected() {
        let config = Config {
            user_id: "  ".to_string(),
            ..Config::default()
        };
        assert!(matches!(check(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_search_limit_bounds() {
        let mut config = Config {
            search_limit: 0,
            ..Config::default()
        };
        assert!(check(&config).is_err());

        config.search_limit = 1;
        assert!(check(&config).is_ok());

        config.search_limit = 10_000;
        assert!(check(&config).is_ok());

        config.search_limit = 10_001;
        assert!(check(&config).is_err());
    }

    #[test]
    fn test_rrf_k_must_be_positive() {
        let mut config = Config {
            rrf_k: 0.0,
            ..Config::default()
        };
        assert!(check(&config).is_err());

        config.rrf_k = f64::NAN;
        assert!(check(&config).is_err());

        config.rrf_k = 60.0;
        assert!(check(&config).is_ok());
    }

    #[test]
    fn test_weights_nan_and_negative_rejected() {
        let mut config = Config {
            keyword_weight: f64::INFINITY,
            ..Config::default()
        };
        assert!(check(&config).is_err());

        config.keyword_weight = 1.0;
        config.vector_weight = -0.5;
        assert!(check(&config).is_err());

        config.vector_weight = 0.0;
        assert!(check(&config).is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config {
            extraction_workers: 0,
            ..Config::default()
        };
        assert!(matches!(check(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = Config {
            max_buffered_records: 0,
            ..Config::default()
        };
        assert!(matches!(check(&config), Err(Error::Config(_))));
    }
}
