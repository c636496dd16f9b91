use clap::Subcommand;
use dayring_core::challenge::credentials;

use super::CommandResult;

#[derive(Subcommand)]
pub enum AuthAction {
    /// Store the HTTP generator API key in the OS keyring
    SetKey {
        /// API key
        key: String,
    },
    /// Remove the stored API key
    ClearKey,
    /// Report whether an API key is stored
    Status,
}

pub fn run(action: AuthAction) -> CommandResult {
    match action {
        AuthAction::SetKey { key } => {
            if key.trim().is_empty() {
                return Err("API key must not be empty".into());
            }
            credentials::set(key.trim())?;
            println!("API key stored");
        }
        AuthAction::ClearKey => {
            credentials::delete()?;
            println!("API key removed");
        }
        AuthAction::Status => {
            let stored = credentials::get()?.is_some();
            println!("{}", if stored { "configured" } else { "not configured" });
        }
    }
    Ok(())
}
