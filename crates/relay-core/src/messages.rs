//! Records exchanged with the broker and with HTTP callers.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Broker key record: `{key: string}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionKey {
    pub key: String,
}

/// Broker value record. Both fields are nullable strings in the schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionValue {
    pub input: Option<String>,
    pub callback_url: Option<String>,
}

/// A question ready to be published: key and value records for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundQuestion {
    pub key: QuestionKey,
    pub value: QuestionValue,
}

impl OutboundQuestion {
    /// Build the outbound records for `session_id`.
    ///
    /// `callback_base` is prepended to `/answers/{id}`; pass `""` for a
    /// relative callback path.
    pub fn for_session(session_id: &SessionId, text: impl Into<String>, callback_base: &str) -> Self {
        let callback = format!(
            "{}{}",
            callback_base.trim_end_matches('/'),
            session_id.answer_path()
        );
        Self {
            key: QuestionKey {
                key: session_id.as_str().to_owned(),
            },
            value: QuestionValue {
                input: Some(text.into()),
                callback_url: Some(callback),
            },
        }
    }
}

/// Body of `POST /questions/{id}`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmitQuestion {
    #[serde(default)]
    pub text: Option<String>,
}

impl SubmitQuestion {
    /// Question text, empty when the caller omitted it.
    pub fn into_text(self) -> String {
        self.text.unwrap_or_default()
    }
}

/// One element of the `POST /answers/{id}` body. Extra fields are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct AnswerItem {
    pub response: String,
}
