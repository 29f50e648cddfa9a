#![forbid(unsafe_code)]

// Room access control

pub mod password;

pub use password::PasswordVerifier;
