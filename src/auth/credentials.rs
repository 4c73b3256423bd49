use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "civicdesk";

/// Remember-me storage for the login secret, backed by the OS keychain.
/// Only the secret lives here; tokens are the session store's concern.
pub struct CredentialStore;

impl CredentialStore {
    /// Store a user's password in the OS keychain
    pub fn store(username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve the stored password for a username
    pub fn retrieve(username: &str) -> Result<String> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Delete the stored password for a username
    pub fn delete(username: &str) -> Result<()> {
        let entry = Entry::new(SERVICE_NAME, username)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}
