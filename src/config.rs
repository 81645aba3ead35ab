use crate::error::AppError;

/// Client configuration, sourced from the environment. A `.env` file is
/// loaded automatically in debug builds only; deployments set real
/// variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the hosted platform (row API under `/rest/v1`, identity
    /// under `/auth/v1`).
    pub api_url: String,
    /// Anonymous API key sent with every request.
    pub api_key: String,
    /// HS256 secret the platform signs access tokens with.
    pub jwt_secret: String,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        if cfg!(debug_assertions) {
            let _ = dotenv::dotenv();
        }

        let jwt_secret = std::env::var("FOODIE_JWT_SECRET")
            .map_err(|_| AppError::Config("FOODIE_JWT_SECRET must be set".into()))?;
        if jwt_secret.len() < 32 {
            return Err(AppError::Config(
                "FOODIE_JWT_SECRET must be at least 32 characters long".into(),
            ));
        }

        Ok(Self {
            api_url: std::env::var("FOODIE_API_URL")
                .unwrap_or_else(|_| "http://localhost:54321".into()),
            api_key: std::env::var("FOODIE_API_KEY").unwrap_or_default(),
            jwt_secret,
        })
    }
}
