//! Front-door HTTP Basic gate.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use rama::http::{HeaderMap, header};

use crate::config::AuthConfig;
use crate::secrets::FrontDoorCredentials;

/// Who may use the proxy's front door. Backend authentication is separate and
/// always applied.
#[derive(Debug, Clone, Default)]
pub enum FrontDoor {
    #[default]
    Anonymous,
    Basic(FrontDoorCredentials),
}

impl FrontDoor {
    /// Gate from the static `[auth]` pair, anonymous when none is configured.
    pub fn from_static(auth: &AuthConfig) -> Self {
        match (auth.username.as_deref(), auth.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Self::Basic(FrontDoorCredentials::new(username, password))
            }
            _ => Self::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        let Self::Basic(expected) = self else {
            return true;
        };

        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_basic)
            .is_some_and(|(username, password)| {
                username == expected.username && password == expected.password
            })
    }
}

fn parse_basic(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = B64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
