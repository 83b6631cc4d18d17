//! Profile document stored in a slashtag's drive

use crate::slashtag::Slashtag;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slashtag_core::{Error, Result};
use tracing::debug;

/// Drive path of the profile document
pub const PROFILE_PATH: &str = "/profile.json";

impl Slashtag {
    /// Replace the profile document. Last write wins.
    pub fn set_profile<T: Serialize>(&self, profile: &T) -> Result<()> {
        let json = serde_json::to_vec(profile)?;
        self.drive().write(PROFILE_PATH, json)
    }

    /// Read the profile document.
    ///
    /// For a remote slashtag without a local copy, the owner is contacted
    /// and the drive updated before reading again.
    pub async fn get_profile<T: DeserializeOwned>(&self) -> Result<T> {
        if let Some(json) = self.drive().read(PROFILE_PATH)? {
            return Ok(serde_json::from_slice(&json)?);
        }
        if !self.is_remote() {
            return Err(Error::NotFound(PROFILE_PATH.to_string()));
        }

        let conn = self.connect(self.key())?;
        if conn.opened().await {
            debug!("fetching profile of {}", self.key());
            self.drive().update().await?;
        }

        match self.drive().read(PROFILE_PATH)? {
            Some(json) => Ok(serde_json::from_slice(&json)?),
            None => Err(Error::NotFound(PROFILE_PATH.to_string())),
        }
    }
}
