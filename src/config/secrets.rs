//! Secret handling utilities.
//!
//! Re-exports secrecy types so the dispatcher token and database url can be
//! passed around without leaking into logs.

pub use secrecy::{ExposeSecret, SecretString};
