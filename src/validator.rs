//! Schema and signature checks deciding whether a record may be stored.

use std::sync::Arc;

use tracing::debug;

use crate::common::{is_valid_key, parse_timestamp, Record};
use crate::signing::SignatureVerifier;

/// Minimum length of a user's `display_name`.
pub const MIN_USERNAME_LENGTH: usize = 2;
/// Maximum length of a user's `display_name`.
pub const MAX_USERNAME_LENGTH: usize = 30;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Reason a record was rejected.
pub enum ValidationError {
    #[error("Key must be 64 hexadecimal characters, got {0:?}")]
    InvalidKey(String),

    #[error("Value is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("Value has no metadata")]
    MissingMetadata,

    #[error("Unknown metadata {0:?}")]
    UnknownMetadata(String),

    #[error("Missing required field {0:?}")]
    MissingField(&'static str),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Invalid signing address")]
    InvalidSigningAddress,

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Record has expired")]
    Expired,

    /// The update tries to change the record type.
    #[error("Metadata mismatch")]
    MetadataChanged,

    #[error("Immutable field {0:?} was changed")]
    ImmutableFieldChanged(&'static str),

    /// Updates must be freshly signed.
    #[error("Signature is outdated")]
    StaleSignature,

    #[error("Unparseable timestamp {0:?}")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of an accepted update.
pub enum Update {
    /// The candidate supersedes the stored value.
    Replace,
    /// The stored value is at least as recent, keep it.
    AlreadyCurrent,
}

#[derive(Debug, Clone)]
/// Decides whether a candidate record may be accepted.
pub struct Validator {
    verifier: Arc<dyn SignatureVerifier>,
}

impl Validator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { verifier }
    }

    /// Check a key/value pair end to end, returning the parsed record.
    ///
    /// Does not touch any store; purging an expired copy is up to the caller.
    pub fn validate(&self, key: &str, value: &str) -> Result<Record, ValidationError> {
        if !is_valid_key(key) {
            return Err(ValidationError::InvalidKey(key.to_string()));
        }

        let record = Record::parse(value)?;

        self.validate_fields(&record)?;
        self.verify(&record)?;

        if record.is_expired() {
            return Err(ValidationError::Expired);
        }

        Ok(record)
    }

    /// Type specific checks beyond the presence of required fields.
    pub fn validate_fields(&self, record: &Record) -> Result<(), ValidationError> {
        if let Record::User(user) = record {
            if let Some(display_name) = &user.display_name {
                if !is_valid_username(display_name) {
                    return Err(ValidationError::InvalidField(format!(
                        "display_name {display_name:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Verify the record's signature over its signed claim.
    pub fn verify(&self, record: &Record) -> Result<(), ValidationError> {
        let Some((message, address)) = record.signed_claim() else {
            return Ok(());
        };

        if !self.verifier.is_valid_address(address) {
            return Err(ValidationError::InvalidSigningAddress);
        }

        let signature = record.signature().unwrap_or_default();
        if !self.verifier.signature_format().matches(signature) {
            return Err(ValidationError::MalformedSignature);
        }

        if !self.verifier.verify(message, address, signature) {
            return Err(ValidationError::BadSignature);
        }

        Ok(())
    }

    /// Decide whether `candidate` may overwrite `current` for the same key.
    ///
    /// Both are expected to have passed [Self::validate].
    pub fn check_update(
        &self,
        current: &Record,
        candidate: &Record,
    ) -> Result<Update, ValidationError> {
        if current.metadata() != candidate.metadata() {
            return Err(ValidationError::MetadataChanged);
        }

        for ((field, old), (_, new)) in current
            .immutable_fields()
            .into_iter()
            .zip(candidate.immutable_fields())
        {
            if old != new {
                return Err(ValidationError::ImmutableFieldChanged(field));
            }
        }

        if let (Some(old), Some(new)) = (current.signature(), candidate.signature()) {
            if old == new {
                return Err(ValidationError::StaleSignature);
            }
        }

        match (current.last_updated(), candidate.last_updated()) {
            (Some(_), None) => Ok(Update::AlreadyCurrent),
            (None, _) => Ok(Update::Replace),
            (Some(old), Some(new)) => {
                let new = parse_timestamp(new)
                    .ok_or_else(|| ValidationError::InvalidTimestamp(new.to_string()))?;

                match parse_timestamp(old) {
                    Some(old) if old >= new => Ok(Update::AlreadyCurrent),
                    Some(_) => Ok(Update::Replace),
                    None => {
                        debug!(?old, "Stored record has an unparseable last_updated");
                        Ok(Update::Replace)
                    }
                }
            }
        }
    }
}

/// Alphanumeric plus `_`, `-` and `.`, starting with a letter and not ending in a symbol.
pub fn is_valid_username(name: &str) -> bool {
    let length = name.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&length) {
        return false;
    }

    let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    let ends_alphanumeric = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());

    starts_with_letter
        && ends_alphanumeric
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::signing::{Ed25519Signer, Ed25519Verifier};

    const KEY: &str = "a3f1c0ffee00000000000000000000000000000000000000000000000000beef";

    fn validator() -> Validator {
        Validator::new(Arc::new(Ed25519Verifier))
    }

    fn user(signer: &Ed25519Signer, last_updated: Option<&str>) -> String {
        let address = signer.address();
        let mut value = json!({
            "metadata": "user",
            "created_at": "2024-01-01T00:00:00Z",
            "monero_address": address,
            "public_key": "pk",
            "signature": signer.sign(&address),
            "display_name": "alice",
        });

        if let Some(last_updated) = last_updated {
            value["last_updated"] = json!(last_updated);
        }

        value.to_string()
    }

    fn parse(value: &str) -> Record {
        Record::parse(value).unwrap()
    }

    #[test]
    fn valid_user() {
        let signer = Ed25519Signer::random();

        assert!(validator().validate(KEY, &user(&signer, None)).is_ok());
    }

    #[test]
    fn invalid_key() {
        let signer = Ed25519Signer::random();
        let value = user(&signer, None);

        assert!(matches!(
            validator().validate(&KEY[1..], &value),
            Err(ValidationError::InvalidKey(_))
        ));
        assert!(matches!(
            validator().validate(&KEY.replace('a', "x"), &value),
            Err(ValidationError::InvalidKey(_))
        ));
    }

    #[test]
    fn tampered_signature() {
        let signer = Ed25519Signer::random();
        let mut value: serde_json::Value = serde_json::from_str(&user(&signer, None)).unwrap();
        value["signature"] = json!(signer.sign("something else"));

        assert_eq!(
            validator().validate(KEY, &value.to_string()).unwrap_err(),
            ValidationError::BadSignature
        );

        value["signature"] = json!("Sig-too-short");
        assert_eq!(
            validator().validate(KEY, &value.to_string()).unwrap_err(),
            ValidationError::MalformedSignature
        );
    }

    #[test]
    fn multibyte_signature_is_rejected() {
        let signer = Ed25519Signer::random();
        let mut value: serde_json::Value = serde_json::from_str(&user(&signer, None)).unwrap();
        value["signature"] = json!(format!("Sig{}é{}", "a".repeat(31), "b".repeat(127)));

        assert_eq!(
            validator().validate(KEY, &value.to_string()).unwrap_err(),
            ValidationError::BadSignature
        );
    }

    #[test]
    fn invalid_signing_address() {
        let signer = Ed25519Signer::random();
        let mut value: serde_json::Value = serde_json::from_str(&user(&signer, None)).unwrap();
        value["monero_address"] = json!("4AdUndXHHZ6cfufTMvppY6JwXNouMBzSkbLYfpAV5Usx");

        assert_eq!(
            validator().validate(KEY, &value.to_string()).unwrap_err(),
            ValidationError::InvalidSigningAddress
        );
    }

    #[test]
    fn signed_listing_and_rating() {
        let seller = Ed25519Signer::random();
        let listing = json!({
            "metadata": "listing",
            "id": "9f1e5c9a-uuid",
            "seller_id": seller.address(),
            "signature": seller.sign("9f1e5c9a-uuid"),
        });
        assert!(validator().validate(KEY, &listing.to_string()).is_ok());

        let rater = Ed25519Signer::random();
        let rating = json!({
            "metadata": "seller_rating",
            "comments": "fast shipping",
            "rater_id": rater.address(),
            "signature": rater.sign("fast shipping"),
        });
        assert!(validator().validate(KEY, &rating.to_string()).is_ok());

        let forged = json!({
            "metadata": "product_rating",
            "comments": "fast shipping",
            "rater_id": seller.address(),
            "signature": rater.sign("fast shipping"),
        });
        assert_eq!(
            validator().validate(KEY, &forged.to_string()).unwrap_err(),
            ValidationError::BadSignature
        );
    }

    #[test]
    fn orders_and_messages_are_not_verified() {
        let order = json!({"metadata": "order", "blob": "ciphertext"});

        assert!(validator().validate(KEY, &order.to_string()).is_ok());
    }

    #[test]
    fn expired() {
        let message = json!({"metadata": "message", "expiration_date": "2001-01-01 00:00:00"});

        assert_eq!(
            validator().validate(KEY, &message.to_string()).unwrap_err(),
            ValidationError::Expired
        );
    }

    #[test]
    fn display_name_rules() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("al.ice_99"));
        assert!(!is_valid_username("a"));
        assert!(!is_valid_username(&"a".repeat(31)));
        assert!(!is_valid_username("9lives"));
        assert!(!is_valid_username("alice_"));
        assert!(!is_valid_username("ali ce"));

        let signer = Ed25519Signer::random();
        let mut value: serde_json::Value = serde_json::from_str(&user(&signer, None)).unwrap();
        value["display_name"] = json!("x");

        assert!(matches!(
            validator().validate(KEY, &value.to_string()),
            Err(ValidationError::InvalidField(_))
        ));
    }

    #[test]
    fn update_requires_fresh_signature() {
        let signer = Ed25519Signer::random();
        let current = parse(&user(&signer, Some("2024-01-01T00:00:00Z")));

        let mut same_signature = current.clone();
        if let Record::User(user) = &mut same_signature {
            user.last_updated = Some("2024-02-01T00:00:00Z".to_string());
        }

        assert_eq!(
            validator().check_update(&current, &same_signature),
            Err(ValidationError::StaleSignature)
        );
    }

    #[test]
    fn update_keeps_immutable_fields() {
        let signer = Ed25519Signer::random();
        let other = Ed25519Signer::random();

        let current = parse(&user(&signer, None));
        let candidate = parse(&user(&other, None));

        assert_eq!(
            validator().check_update(&current, &candidate),
            Err(ValidationError::ImmutableFieldChanged("monero_address"))
        );

        let order = parse(r#"{"metadata": "order"}"#);
        assert_eq!(
            validator().check_update(&current, &order),
            Err(ValidationError::MetadataChanged)
        );
    }

    #[test]
    fn update_most_recent_wins() {
        let signer = Ed25519Signer::random();
        let older = parse(&user(&signer, Some("2024-01-01T00:00:00Z")));
        let newer = parse(&user(&signer, Some("2024-03-01 08:00:00")));
        let undated = parse(&user(&signer, None));

        assert_eq!(validator().check_update(&older, &newer), Ok(Update::Replace));
        assert_eq!(
            validator().check_update(&newer, &older),
            Ok(Update::AlreadyCurrent)
        );
        assert_eq!(
            validator().check_update(&newer, &undated),
            Ok(Update::AlreadyCurrent)
        );
        assert_eq!(validator().check_update(&undated, &newer), Ok(Update::Replace));

        let garbage = parse(&user(&signer, Some("last tuesday")));
        assert!(matches!(
            validator().check_update(&older, &garbage),
            Err(ValidationError::InvalidTimestamp(_))
        ));
    }
}
