#![forbid(unsafe_code)]

use crate::auth::PasswordVerifier;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PARTICIPANTS: usize = 20;
pub const MAX_PARTICIPANTS_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_verifier: Option<PasswordVerifier>,
    pub max_participants: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            is_private: false,
            password_verifier: None,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

impl RoomSettings {
    pub fn with_capacity(max_participants: usize) -> Self {
        Self {
            max_participants: max_participants.clamp(1, MAX_PARTICIPANTS_LIMIT),
            ..Self::default()
        }
    }

    /// Makes the room private behind `password`.
    pub fn with_password(mut self, password: &str) -> Result<Self, argon2::password_hash::Error> {
        self.password_verifier = Some(PasswordVerifier::create(password)?);
        self.is_private = true;
        Ok(self)
    }

    /// Public rooms admit anyone. Private rooms need a verifier and a matching password.
    pub fn admits(&self, supplied: Option<&str>) -> bool {
        if !self.is_private {
            return true;
        }
        match (&self.password_verifier, supplied) {
            (Some(verifier), Some(password)) => verifier.verify(password),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RoomSettings::default();
        assert!(!settings.is_private);
        assert_eq!(settings.max_participants, 20);
        assert!(settings.admits(None));
        assert!(settings.admits(Some("whatever")));
    }

    #[test]
    fn test_capacity_bounds() {
        assert_eq!(RoomSettings::with_capacity(0).max_participants, 1);
        assert_eq!(RoomSettings::with_capacity(500).max_participants, MAX_PARTICIPANTS_LIMIT);
    }

    #[test]
    fn test_private_room_requires_password() {
        let settings = RoomSettings::default().with_password("hunter2").unwrap();
        assert!(settings.is_private);
        assert!(settings.admits(Some("hunter2")));
        assert!(!settings.admits(Some("hunter3")));
        assert!(!settings.admits(None));
    }

    #[test]
    fn test_snapshot_never_holds_plaintext() {
        let settings = RoomSettings::default().with_password("plaintext-pw").unwrap();
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("plaintext-pw"));
        assert!(json.contains("passwordVerifier"));
        let back: RoomSettings = serde_json::from_str(&json).unwrap();
        assert!(back.admits(Some("plaintext-pw")));
    }
}
