use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Caller-supplied conversation identifier. Opaque to the relay.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path the external consumer posts its answer to.
    pub fn answer_path(&self) -> String {
        format!("/answers/{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_path_embeds_id() {
        let id = SessionId::from_raw("abc");
        assert_eq!(id.answer_path(), "/answers/abc");
    }

    #[test]
    fn serde_transparent() {
        let id = SessionId::from_raw("discussion-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"discussion-42\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_and_from_str_agree() {
        let id: SessionId = "s-1".parse().unwrap();
        assert_eq!(id.to_string(), "s-1");
        assert_eq!(id.as_ref(), "s-1");
    }
}
