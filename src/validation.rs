//! Input checks applied at the protocol boundary, before a room is touched.

use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::error::GameError;

/// Letters used for generated codes; I, L and O are left out because they read like digits.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ";
const CODE_LEN: usize = 4;

const MAX_NAME_CHARS: usize = 20;
const MAX_TEXT_CHARS: usize = 1000;
const MAX_FIELD_CHARS: usize = 500;
const ALLOWED_FIELDS: [&str; 5] = ["choice", "optionId", "answerId", "value", "text"];

const SUBMISSION_KEYS: [&str; 5] = ["text", "value", "choice", "answerId", "optionId"];
const VOTE_KEYS: [&str; 5] = ["optionId", "answerId", "choice", "value", "text"];

/// A validated four-letter room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Accepts exactly four ASCII uppercase letters.
    pub fn parse(raw: &str) -> Result<Self, GameError> {
        if raw.len() == CODE_LEN && raw.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(raw.to_string()))
        } else {
            Err(GameError::InvalidRoomCode)
        }
    }

    /// Like [`RoomCode::parse`] but upper-cases the input first.
    pub fn parse_lenient(raw: &str) -> Result<Self, GameError> {
        Self::parse(&raw.trim().to_ascii_uppercase())
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LEN)
            .map(|_| char::from(CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())]))
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trims, strips `< > ' " &`, collapses whitespace and caps the length.
pub fn sanitize_player_name(raw: &str) -> Result<String, GameError> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '\'' | '"' | '&'))
        .collect();

    let mut collapsed = String::with_capacity(stripped.len());
    let mut in_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() {
            if !in_space {
                collapsed.push(' ');
            }
            in_space = true;
        } else {
            collapsed.push(c);
            in_space = false;
        }
    }

    let name: String = collapsed.chars().take(MAX_NAME_CHARS).collect();
    if name.is_empty() {
        return Err(GameError::InvalidPlayerName);
    }
    Ok(name)
}

/// A primitive value kept from an object payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

/// Submission or vote data after sanitizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Fields(BTreeMap<String, Scalar>),
}

impl Payload {
    /// Answer text: the plain string, or the first string field by preference.
    pub fn submission_text(&self) -> Option<&str> {
        self.first_text(&SUBMISSION_KEYS)
    }

    /// Id of the player being voted for.
    pub fn vote_target(&self) -> Option<&str> {
        self.first_text(&VOTE_KEYS)
    }

    fn first_text(&self, keys: &[&str]) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text.as_str()),
            Payload::Fields(fields) => keys.iter().find_map(|key| match fields.get(*key) {
                Some(Scalar::Text(text)) => Some(text.as_str()),
                _ => None,
            }),
        }
    }
}

/// Validates and cleans a submission/vote payload. `kind` names the event in the error.
pub fn sanitize_payload(data: &Value, kind: &'static str) -> Result<Payload, GameError> {
    match data {
        Value::String(text) => Ok(Payload::Text(clean_text(text, MAX_TEXT_CHARS))),
        Value::Object(map) => {
            let mut fields = BTreeMap::new();
            for key in ALLOWED_FIELDS {
                let Some(value) = map.get(key) else { continue };
                let scalar = match value {
                    Value::String(text) => Scalar::Text(clean_text(text, MAX_FIELD_CHARS)),
                    Value::Number(number) => Scalar::Number(number.clone()),
                    Value::Bool(flag) => Scalar::Bool(*flag),
                    _ => return Err(GameError::InvalidPayload(kind)),
                };
                fields.insert(key.to_string(), scalar);
            }
            Ok(Payload::Fields(fields))
        }
        _ => Err(GameError::InvalidPayload(kind)),
    }
}

fn clean_text(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .filter(|c| *c != '<' && *c != '>')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    #[test]
    fn room_code_accepts_four_uppercase_letters() {
        assert_eq!(RoomCode::parse("ABCD").unwrap().as_str(), "ABCD");
        assert!(RoomCode::parse("abcd").is_err());
        assert!(RoomCode::parse("ABC").is_err());
        assert!(RoomCode::parse("ABCDE").is_err());
        assert!(RoomCode::parse("AB1D").is_err());
        assert!(RoomCode::parse("ÄBCD").is_err());
    }

    #[test]
    fn lenient_parse_uppercases() {
        assert_eq!(RoomCode::parse_lenient(" abcd ").unwrap().as_str(), "ABCD");
        assert_eq!(RoomCode::parse_lenient("ab1d"), Err(GameError::InvalidRoomCode));
    }

    #[test]
    fn generated_codes_avoid_ambiguous_letters() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = RoomCode::generate(&mut rng);
            assert!(RoomCode::parse(code.as_str()).is_ok());
            assert!(!code.as_str().contains(['I', 'L', 'O']));
        }
    }

    #[test]
    fn player_names_are_sanitized() {
        assert_eq!(sanitize_player_name("  Alice  ").unwrap(), "Alice");
        assert_eq!(sanitize_player_name("<b>Bob</b>").unwrap(), "bBob/b");
        assert_eq!(sanitize_player_name("Tom   &  \"Jerry\"").unwrap(), "Tom Jerry");
        assert_eq!(
            sanitize_player_name("abcdefghijklmnopqrstuvwxyz").unwrap(),
            "abcdefghijklmnopqrst"
        );
    }

    #[test]
    fn empty_names_are_rejected() {
        assert_eq!(sanitize_player_name(""), Err(GameError::InvalidPlayerName));
        assert_eq!(sanitize_player_name("   "), Err(GameError::InvalidPlayerName));
        assert_eq!(sanitize_player_name(" <>&'\" "), Err(GameError::InvalidPlayerName));
    }

    #[test]
    fn string_payloads_are_truncated_and_stripped() {
        let long = "x".repeat(1500);
        let Payload::Text(text) = sanitize_payload(&json!(long), "submission").unwrap() else {
            panic!("expected text payload");
        };
        assert_eq!(text.chars().count(), 1000);

        let payload = sanitize_payload(&json!("<script>hi</script>"), "submission").unwrap();
        assert_eq!(payload, Payload::Text("scripthi/script".into()));
    }

    #[test]
    fn object_payloads_keep_only_allowed_primitives() {
        let payload = sanitize_payload(
            &json!({"choice": "<p2>", "value": 3, "text": true, "evil": {"nested": 1}}),
            "vote",
        )
        .unwrap();
        let Payload::Fields(fields) = &payload else {
            panic!("expected object payload");
        };
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["choice"], Scalar::Text("p2".into()));
        assert_eq!(fields["value"], Scalar::Number(3.into()));
        assert_eq!(fields["text"], Scalar::Bool(true));
        assert_eq!(payload.vote_target(), Some("p2"));

        let long = "y".repeat(800);
        let payload = sanitize_payload(&json!({ "text": long }), "submission").unwrap();
        assert_eq!(payload.submission_text().map(|t| t.len()), Some(500));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        for data in [json!(null), json!(42), json!(true), json!(["a"]), json!({"text": ["a"]})] {
            assert_eq!(sanitize_payload(&data, "vote"), Err(GameError::InvalidPayload("vote")));
        }
    }

    #[test]
    fn text_extraction_prefers_the_right_keys() {
        let payload = sanitize_payload(&json!({"optionId": "p3", "text": "funny"}), "x").unwrap();
        assert_eq!(payload.submission_text(), Some("funny"));
        assert_eq!(payload.vote_target(), Some("p3"));

        let payload = sanitize_payload(&json!({"value": 1}), "x").unwrap();
        assert_eq!(payload.submission_text(), None);
    }
}
