use std::fmt;
use thiserror::Error;

use crate::socks5::codec::{METHOD_NO_AUTH, METHOD_USER_PASS};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("Username cannot be empty")]
    EmptyUsername,
    #[error("{field} is {len} bytes, RFC 1929 allows at most 255")]
    CredentialTooLong { field: &'static str, len: usize },
}

/// RFC 1929 username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Result<Self, AuthError> {
        if username.is_empty() {
            return Err(AuthError::EmptyUsername);
        }
        for (field, value) in [("Username", username), ("Password", password)] {
            if value.len() > u8::MAX as usize {
                return Err(AuthError::CredentialTooLong {
                    field,
                    len: value.len(),
                });
            }
        }
        Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Methods to offer in the negotiation request, in preference order.
pub fn offered_methods(credentials: Option<&Credentials>, force_auth: bool) -> Vec<u8> {
    match (credentials, force_auth) {
        (Some(_), true) => vec![METHOD_USER_PASS],
        (Some(_), false) => vec![METHOD_NO_AUTH, METHOD_USER_PASS],
        (None, _) => vec![METHOD_NO_AUTH],
    }
}
