use std::path::PathBuf;

use anyhow::{anyhow, Result};

pub const DEFAULT_QUERY: &str = "label:Recipes";
pub const DEFAULT_PAGE_SIZE: u32 = 25;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 3;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_LIST_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORE_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOG_DIRECTIVE: &str = "recipe_sync=info";

pub const APP_DIR_NAME: &str = ".recipe-sync";
pub const DATABASE_FILE_NAME: &str = "recipes.db";
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";
pub const TOKEN_FILE_NAME: &str = "token.json";

pub const ENV_CLIENT_ID: &str = "RECIPE_SYNC_GMAIL_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "RECIPE_SYNC_GMAIL_CLIENT_SECRET";
pub const ENV_REFRESH_TOKEN: &str = "RECIPE_SYNC_GMAIL_REFRESH_TOKEN";
pub const ENV_API_URL: &str = "RECIPE_SYNC_GMAIL_API_URL";
pub const ENV_TOKEN_URL: &str = "RECIPE_SYNC_GMAIL_TOKEN_URL";

/// `~/.recipe-sync`, home of the database and the OAuth files.
pub fn app_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("failed to determine home directory"))?;
    Ok(home.join(APP_DIR_NAME))
}

pub fn default_credentials_path() -> Result<PathBuf> {
    Ok(app_dir()?.join(CREDENTIALS_FILE_NAME))
}

pub fn default_token_path() -> Result<PathBuf> {
    Ok(app_dir()?.join(TOKEN_FILE_NAME))
}

/// Reads an environment variable, treating blank values as unset.
pub fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
