//! Typed view over the JSON envelopes stored in the DHT.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::validator::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The `metadata` discriminator of a record.
pub enum Metadata {
    User,
    Listing,
    ProductRating,
    SellerRating,
    Order,
    Message,
}

impl Metadata {
    pub fn parse(value: &str) -> Option<Metadata> {
        Some(match value {
            "user" => Metadata::User,
            "listing" => Metadata::Listing,
            "product_rating" => Metadata::ProductRating,
            "seller_rating" => Metadata::SellerRating,
            "order" => Metadata::Order,
            "message" => Metadata::Message,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Metadata::User => "user",
            Metadata::Listing => "listing",
            Metadata::ProductRating => "product_rating",
            Metadata::SellerRating => "seller_rating",
            Metadata::Order => "order",
            Metadata::Message => "message",
        }
    }

    /// Fields that must be present for a record of this type.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Metadata::User => &["created_at", "monero_address", "public_key", "signature"],
            Metadata::Listing => &["id", "seller_id", "signature"],
            Metadata::ProductRating | Metadata::SellerRating => {
                &["comments", "rater_id", "signature"]
            }
            Metadata::Order | Metadata::Message => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
    pub created_at: String,
    pub monero_address: String,
    pub public_key: String,
    pub signature: String,
    pub display_name: Option<String>,
    pub avatar: Option<Avatar>,
    pub last_updated: Option<String>,
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Avatar {
    pub name: String,
    pub size: u64,
    pub pieces: Vec<Value>,
    pub piece_size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Listing {
    pub id: String,
    pub seller_id: String,
    pub signature: String,
    pub last_updated: Option<String>,
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rating {
    pub comments: String,
    pub rater_id: String,
    pub signature: String,
    pub last_updated: Option<String>,
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Orders and messages are encrypted for their recipient, so peers only see the envelope.
pub struct Sealed {
    pub signature: Option<String>,
    pub last_updated: Option<String>,
    pub expiration_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "metadata", rename_all = "snake_case")]
/// A parsed DHT value.
pub enum Record {
    User(User),
    Listing(Listing),
    ProductRating(Rating),
    SellerRating(Rating),
    Order(Sealed),
    Message(Sealed),
}

impl Record {
    /// Parse a JSON value, reporting which part of the envelope is wrong.
    pub fn parse(value: &str) -> Result<Record, ValidationError> {
        let json: Value =
            serde_json::from_str(value).map_err(|e| ValidationError::InvalidJson(e.to_string()))?;

        let object = json
            .as_object()
            .ok_or_else(|| ValidationError::InvalidJson("not a JSON object".to_string()))?;

        let metadata = match object.get("metadata") {
            Some(Value::String(metadata)) => metadata,
            Some(_) | None => return Err(ValidationError::MissingMetadata),
        };

        let metadata = Metadata::parse(metadata)
            .ok_or_else(|| ValidationError::UnknownMetadata(metadata.to_string()))?;

        if let Some(field) = metadata
            .required_fields()
            .iter()
            .find(|field| !object.contains_key(**field))
        {
            return Err(ValidationError::MissingField(*field));
        }

        serde_json::from_value(json).map_err(|e| ValidationError::InvalidField(e.to_string()))
    }

    pub fn metadata(&self) -> Metadata {
        match self {
            Record::User(_) => Metadata::User,
            Record::Listing(_) => Metadata::Listing,
            Record::ProductRating(_) => Metadata::ProductRating,
            Record::SellerRating(_) => Metadata::SellerRating,
            Record::Order(_) => Metadata::Order,
            Record::Message(_) => Metadata::Message,
        }
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            Record::User(user) => Some(user.signature.as_str()),
            Record::Listing(listing) => Some(listing.signature.as_str()),
            Record::ProductRating(rating) | Record::SellerRating(rating) => {
                Some(rating.signature.as_str())
            }
            Record::Order(sealed) | Record::Message(sealed) => sealed.signature.as_deref(),
        }
    }

    pub fn last_updated(&self) -> Option<&str> {
        match self {
            Record::User(user) => user.last_updated.as_deref(),
            Record::Listing(listing) => listing.last_updated.as_deref(),
            Record::ProductRating(rating) | Record::SellerRating(rating) => {
                rating.last_updated.as_deref()
            }
            Record::Order(sealed) | Record::Message(sealed) => sealed.last_updated.as_deref(),
        }
    }

    pub fn expiration_date(&self) -> Option<&str> {
        match self {
            Record::User(user) => user.expiration_date.as_deref(),
            Record::Listing(listing) => listing.expiration_date.as_deref(),
            Record::ProductRating(rating) | Record::SellerRating(rating) => {
                rating.expiration_date.as_deref()
            }
            Record::Order(sealed) | Record::Message(sealed) => sealed.expiration_date.as_deref(),
        }
    }

    /// The `(message, signing address)` pair a signature must cover.
    ///
    /// `None` for orders and messages, which only their recipient can verify.
    pub fn signed_claim(&self) -> Option<(&str, &str)> {
        match self {
            Record::User(user) => {
                Some((user.monero_address.as_str(), user.monero_address.as_str()))
            }
            Record::Listing(listing) => Some((listing.id.as_str(), listing.seller_id.as_str())),
            Record::ProductRating(rating) | Record::SellerRating(rating) => {
                Some((rating.comments.as_str(), rating.rater_id.as_str()))
            }
            Record::Order(_) | Record::Message(_) => None,
        }
    }

    /// Fields that may never change once the record is stored.
    pub fn immutable_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Record::User(user) => vec![("monero_address", user.monero_address.as_str())],
            Record::Listing(listing) => {
                vec![
                    ("id", listing.id.as_str()),
                    ("seller_id", listing.seller_id.as_str()),
                ]
            }
            Record::ProductRating(rating) | Record::SellerRating(rating) => {
                vec![("rater_id", rating.rater_id.as_str())]
            }
            Record::Order(_) | Record::Message(_) => vec![],
        }
    }

    /// Listings travel through `map` announcements, never the replicated `put` path.
    pub fn is_publishable(&self) -> bool {
        !matches!(self, Record::Listing(_))
    }

    /// Returns `true` if `expiration_date` is set and lies before `now`.
    ///
    /// An unparseable expiration date counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expiration_date() {
            Some(date) => parse_timestamp(date).map(|date| date <= now).unwrap_or(true),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Parse an RFC 3339 timestamp, falling back to a naive `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
