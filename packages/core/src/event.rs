//! Event envelope types exchanged with relays.
//!
//! The worker treats the envelope as opaque: it reads ids, kinds, tags and
//! content from inbound requests and produces [`EventTemplate`]s that a
//! signer turns into publishable [`Event`]s.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kinds a job request may carry. Results are published at `kind + 1000`.
pub const JOB_REQUEST_KINDS: RangeInclusive<u16> = 5000..=5999;

/// Offset between a job request kind and its result kind.
const RESULT_KIND_OFFSET: u16 = 1000;

/// Errors raised while building or inspecting events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("invalid hex id '{0}': expected 64 lowercase hex characters")]
    InvalidId(String),

    #[error("kind {0} is not a job request kind (5000-5999)")]
    NotJobRequest(Kind),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 32-byte hex identifier of an event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Parse an event id from its hex form.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        parse_hex32(s).map(Self)
    }

    /// Build an id from a raw sha256 digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 32-byte hex public key identifying an event author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(String);

impl PublicKey {
    /// Parse a public key from its hex form.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        parse_hex32(s).map(Self)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_hex32(s: &str) -> Result<String, EventError> {
    let valid = s.len() == 64
        && s
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if valid {
        Ok(s.to_string())
    } else {
        Err(EventError::InvalidId(s.to_string()))
    }
}

/// Integer tag identifying the semantic type of an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Kind(pub u16);

impl Kind {
    /// Kind of job feedback (status) events.
    pub const JOB_FEEDBACK: Kind = Kind(7000);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether this kind lies in the job request range.
    pub fn is_job_request(self) -> bool {
        JOB_REQUEST_KINDS.contains(&self.0)
    }

    /// Result kind paired with this request kind.
    pub fn result_kind(self) -> Result<Kind, EventError> {
        if self.is_job_request() {
            Ok(Kind(self.0 + RESULT_KIND_OFFSET))
        } else {
            Err(EventError::NotJobRequest(self))
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Kind {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Unix timestamp in seconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp().max(0) as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single event tag, e.g. `["e", "<id>"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(Vec<String>);

impl Tag {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.get(0)
    }

    /// The first value after the name.
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// A signed event as carried by relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub created_at: Timestamp,
    pub kind: Kind,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// All tags with the given name.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// Value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// Whether `id` matches the canonical hash of the event fields.
    pub fn has_valid_id(&self) -> bool {
        let template = EventTemplate {
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        };
        template.compute_id(&self.pubkey, self.created_at) == self.id
    }

    pub fn as_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Unsigned event content produced by the worker and handed to a signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventTemplate {
    pub fn new(kind: Kind, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Canonical id: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self, pubkey: &PublicKey, created_at: Timestamp) -> EventId {
        let canonical = serde_json::json!([
            0,
            pubkey.as_str(),
            created_at.as_u64(),
            self.kind.as_u16(),
            &self.tags,
            &self.content
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        EventId(hex::encode(digest))
    }

    /// Complete the template into an event carrying the given signature.
    pub fn into_event(self, pubkey: PublicKey, created_at: Timestamp, sig: String) -> Event {
        let id = self.compute_id(&pubkey, created_at);
        Event {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// Status carried by a job feedback event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackStatus {
    PaymentRequired,
    Processing,
    Error,
    Success,
    Partial,
}

impl FeedbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::PaymentRequired => "payment-required",
            FeedbackStatus::Processing => "processing",
            FeedbackStatus::Error => "error",
            FeedbackStatus::Success => "success",
            FeedbackStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builders for the outward job events.
pub struct EventBuilder;

impl EventBuilder {
    /// Feedback event announcing `status` for a job request.
    pub fn job_feedback(
        request: &Event,
        status: FeedbackStatus,
        extra_info: Option<&str>,
        amount_msats: Option<u64>,
    ) -> EventTemplate {
        let mut status_tag = vec![status.as_str().to_string()];
        if let Some(info) = extra_info {
            status_tag.push(info.to_string());
        }

        let mut template = EventTemplate::new(Kind::JOB_FEEDBACK, "")
            .with_tag(Tag::new(std::iter::once("status".to_string()).chain(status_tag)))
            .with_tag(Tag::new(["e", request.id.as_str()]))
            .with_tag(Tag::new(["p", request.pubkey.as_str()]));

        if let Some(amount) = amount_msats {
            template = template.with_tag(Tag::new(["amount".to_string(), amount.to_string()]));
        }
        template
    }

    /// Result event carrying the work output for a job request.
    pub fn job_result(
        request: &Event,
        content: impl Into<String>,
        amount_msats: u64,
    ) -> Result<EventTemplate, EventError> {
        let kind = request.kind.result_kind()?;
        let mut template = EventTemplate::new(kind, content)
            .with_tag(Tag::new(["request".to_string(), request.as_json()?]))
            .with_tag(Tag::new(["e", request.id.as_str()]))
            .with_tag(Tag::new(["p", request.pubkey.as_str()]));

        for input in request.tags_named("i") {
            template = template.with_tag(input.clone());
        }

        Ok(template.with_tag(Tag::new(["amount".to_string(), amount_msats.to_string()])))
    }
}

/// Subscription filter over inbound events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: BTreeSet<Kind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether the event passes this filter. An empty kind set matches any kind.
    pub fn matches(&self, event: &Event) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&event.kind);
        let time_ok = self.since.is_none_or(|since| event.created_at >= since);
        kind_ok && time_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_event() -> Event {
        EventTemplate::new(Kind(5050), "ping")
            .with_tag(Tag::new(["i", "hello", "text"]))
            .into_event(PublicKey::from_bytes([7; 32]), Timestamp(1_700_000_000), String::new())
    }

    #[test]
    fn id_is_stable_and_verifiable() {
        let event = request_event();
        assert_eq!(event.id.as_str().len(), 64);
        assert!(event.has_valid_id());

        let mut tampered = event.clone();
        tampered.content = "pong".into();
        assert!(!tampered.has_valid_id());
    }

    #[test]
    fn tag_value_borrows_from_the_event() {
        let event = request_event();
        let value = {
            let name = String::from("i");
            event.tag_value(&name)
        };
        assert_eq!(value, Some("hello"));
        assert_eq!(event.tag_value("missing"), None);
        assert_eq!(event.tags_named("i").count(), 1);
    }

    #[test]
    fn feedback_template_tags_request() {
        let request = request_event();
        let template =
            EventBuilder::job_feedback(&request, FeedbackStatus::Processing, None, Some(0));

        assert_eq!(template.kind, Kind::JOB_FEEDBACK);
        assert_eq!(template.tags[0].as_slice(), ["status", "processing"]);
        assert_eq!(template.tags[1].value(), Some(request.id.as_str()));
        assert_eq!(template.tags[2].value(), Some(request.pubkey.as_str()));
        assert_eq!(template.tags[3].as_slice(), ["amount", "0"]);
    }

    #[test]
    fn result_template_uses_offset_kind_and_copies_inputs() {
        let request = request_event();
        let template = EventBuilder::job_result(&request, "pong", 0).unwrap();

        assert_eq!(template.kind, Kind(6050));
        assert_eq!(template.content, "pong");
        assert!(template.tags.iter().any(|t| t.as_slice() == ["i", "hello", "text"]));
        assert!(template.tags.iter().any(|t| t.as_slice() == ["amount", "0"]));

        let embedded = template
            .tags
            .iter()
            .find(|t| t.name() == Some("request"))
            .and_then(Tag::value)
            .unwrap();
        let parsed: Event = serde_json::from_str(embedded).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn result_rejects_non_request_kind() {
        let note = EventTemplate::new(Kind(1), "hi").into_event(
            PublicKey::from_bytes([1; 32]),
            Timestamp(1),
            String::new(),
        );
        assert!(matches!(
            EventBuilder::job_result(&note, "x", 0),
            Err(EventError::NotJobRequest(Kind(1)))
        ));
    }

    #[test]
    fn filter_checks_kind_and_since() {
        let event = request_event();
        assert!(Filter::new().kinds([Kind(5050)]).matches(&event));
        assert!(!Filter::new().kinds([Kind(5100)]).matches(&event));
        assert!(!Filter::new().since(Timestamp(1_800_000_000)).matches(&event));
        assert!(Filter::new().since(Timestamp(1_700_000_000)).matches(&event));
    }

    #[test]
    fn ids_must_be_lowercase_hex() {
        assert!(EventId::parse(&"ab".repeat(32)).is_ok());
        assert!(EventId::parse(&"AB".repeat(32)).is_err());
        assert!(EventId::parse("abc").is_err());
    }
}
