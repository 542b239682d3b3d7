//! Communication Topic codec.
//!
//! Publication topics have the shape
//! `coaty/<v>/<namespace>/<eventLevel>[:<eventTypeFilter>]/<subject>[/<correlationId>]`
//! as described in `SPEC_FULL.md` §4.2. `<subject>` is the originating
//! agent's `sourceId` for every event level except `IOV`, where it is the
//! IO route instead (Open Question #3 in `SPEC_FULL.md` §9) — there is no
//! single well-known `sourceId` for a route that may carry values from many
//! IO sources.

use std::fmt;

use uuid::Uuid;

use crate::error::{CommError, CommResult};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_NAMESPACE: &str = "-";
const MAX_TOPIC_BYTES: usize = 65535;

/// The three-letter wire code for each of the 11 event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLevel {
    Adv,
    Dad,
    Chn,
    Asc,
    Iov,
    Dsc,
    Rsv,
    Qry,
    Rtv,
    Upd,
    Cpl,
    Cll,
    Rtn,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Adv => "ADV",
            EventLevel::Dad => "DAD",
            EventLevel::Chn => "CHN",
            EventLevel::Asc => "ASC",
            EventLevel::Iov => "IOV",
            EventLevel::Dsc => "DSC",
            EventLevel::Rsv => "RSV",
            EventLevel::Qry => "QRY",
            EventLevel::Rtv => "RTV",
            EventLevel::Upd => "UPD",
            EventLevel::Cpl => "CPL",
            EventLevel::Cll => "CLL",
            EventLevel::Rtn => "RTN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "ADV" => EventLevel::Adv,
            "DAD" => EventLevel::Dad,
            "CHN" => EventLevel::Chn,
            "ASC" => EventLevel::Asc,
            "IOV" => EventLevel::Iov,
            "DSC" => EventLevel::Dsc,
            "RSV" => EventLevel::Rsv,
            "QRY" => EventLevel::Qry,
            "RTV" => EventLevel::Rtv,
            "UPD" => EventLevel::Upd,
            "CPL" => EventLevel::Cpl,
            "CLL" => EventLevel::Cll,
            "RTN" => EventLevel::Rtn,
            _ => return None,
        })
    }

    /// One-way events: Advertise, Deadvertise, Channel, Associate, IoValue.
    pub fn is_one_way(self) -> bool {
        matches!(
            self,
            EventLevel::Adv | EventLevel::Dad | EventLevel::Chn | EventLevel::Asc | EventLevel::Iov
        )
    }

    /// Whether this level carries an `<eventTypeFilter>` segment. `IOV`
    /// topics carry a route as their subject instead and never take a
    /// filter segment.
    pub fn has_filter(self) -> bool {
        matches!(
            self,
            EventLevel::Adv | EventLevel::Chn | EventLevel::Asc | EventLevel::Cll | EventLevel::Upd
        )
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The subject occupying the position after `<eventLevel>[:<filter>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// `sourceId` of the publishing agent's Identity.
    Agent(Uuid),
    /// IO route, used only for `IOV`.
    Route(String),
}

impl Subject {
    fn encode(&self) -> String {
        match self {
            Subject::Agent(id) => id.to_string(),
            Subject::Route(r) => r.clone(),
        }
    }
}

/// A decoded (or to-be-encoded) publication topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub version: u32,
    pub namespace: String,
    pub event_level: EventLevel,
    pub event_type_filter: Option<String>,
    pub subject: Subject,
    pub correlation_id: Option<Uuid>,
}

/// Non-empty UTF-8 string excluding `\0 # + /`.
pub fn is_valid_topic_level(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| matches!(c, '\u{0}' | '#' | '+' | '/'))
}

/// `objectType`/`operation`/`channelId` and friends must additionally pass
/// topic-level validation since they are embedded in the filter segment.
pub fn is_valid_event_filter(s: &str) -> bool {
    is_valid_topic_level(s)
}

impl Topic {
    pub fn new(
        namespace: impl Into<String>,
        event_level: EventLevel,
        event_type_filter: Option<String>,
        subject: Subject,
        correlation_id: Option<Uuid>,
    ) -> CommResult<Self> {
        let namespace = namespace.into();
        if !is_valid_topic_level(&namespace) {
            return Err(CommError::InvalidTopicLevel { level: namespace });
        }
        if let Some(filter) = &event_type_filter {
            if !is_valid_event_filter(filter) {
                return Err(CommError::InvalidTopicLevel {
                    level: filter.clone(),
                });
            }
        }
        if event_level.has_filter() != event_type_filter.is_some() {
            return Err(CommError::MalformedTopic {
                topic: String::new(),
                reason: format!(
                    "{} {} an event type filter",
                    event_level,
                    if event_level.has_filter() {
                        "requires"
                    } else {
                        "forbids"
                    }
                ),
            });
        }
        if event_level.is_one_way() != correlation_id.is_none() {
            return Err(CommError::MalformedTopic {
                topic: String::new(),
                reason: format!(
                    "{} {} a correlation id",
                    event_level,
                    if event_level.is_one_way() {
                        "forbids"
                    } else {
                        "requires"
                    }
                ),
            });
        }
        match (&event_level, &subject) {
            (EventLevel::Iov, Subject::Route(r)) => {
                if !is_valid_topic_level(r) {
                    return Err(CommError::InvalidTopicLevel { level: r.clone() });
                }
            }
            (EventLevel::Iov, Subject::Agent(_)) => {
                return Err(CommError::MalformedTopic {
                    topic: String::new(),
                    reason: "IOV topics carry a route, not an agent id".into(),
                })
            }
            (_, Subject::Route(_)) => {
                return Err(CommError::MalformedTopic {
                    topic: String::new(),
                    reason: "only IOV topics carry a route subject".into(),
                })
            }
            (_, Subject::Agent(_)) => {}
        }
        let topic = Topic {
            version: PROTOCOL_VERSION,
            namespace,
            event_level,
            event_type_filter,
            subject,
            correlation_id,
        };
        topic.validate_length()?;
        Ok(topic)
    }

    fn validate_length(&self) -> CommResult<()> {
        let encoded = self.encode_unchecked();
        if encoded.len() > MAX_TOPIC_BYTES {
            return Err(CommError::MalformedTopic {
                topic: encoded,
                reason: "exceeds maximum topic length of 65535 UTF-8 bytes".into(),
            });
        }
        Ok(())
    }

    fn encode_unchecked(&self) -> String {
        let mut level = self.event_level.as_str().to_string();
        if let Some(filter) = &self.event_type_filter {
            level.push(':');
            level.push_str(filter);
        }
        let mut s = format!(
            "coaty/{}/{}/{}/{}",
            self.version,
            self.namespace,
            level,
            self.subject.encode()
        );
        if let Some(cid) = self.correlation_id {
            s.push('/');
            s.push_str(&cid.to_string());
        }
        s
    }

    pub fn encode(&self) -> String {
        self.encode_unchecked()
    }

    /// Decode a wire-format publication topic. Returns an error for raw
    /// topics; callers should check [`is_raw_topic`] first.
    pub fn decode(topic: &str) -> CommResult<Self> {
        if is_raw_topic(topic) {
            return Err(CommError::MalformedTopic {
                topic: topic.to_string(),
                reason: "raw topics are not coaty event topics".into(),
            });
        }
        let levels: Vec<&str> = topic.split('/').collect();
        // coaty / v / namespace / level[:filter] / subject [/ correlationId]
        if levels.len() < 5 || levels.len() > 6 {
            return Err(CommError::MalformedTopic {
                topic: topic.to_string(),
                reason: format!("expected 5 or 6 topic levels, got {}", levels.len()),
            });
        }
        let version: u32 = levels[1].parse().map_err(|_| CommError::MalformedTopic {
            topic: topic.to_string(),
            reason: "non-integral protocol version".into(),
        })?;
        if version == 0 {
            return Err(CommError::MalformedTopic {
                topic: topic.to_string(),
                reason: "protocol version must be > 0".into(),
            });
        }
        let namespace = levels[2].to_string();
        let (level_str, filter) = match levels[3].split_once(':') {
            Some((l, f)) => (l, Some(f.to_string())),
            None => (levels[3], None),
        };
        let event_level = EventLevel::from_str(level_str).ok_or_else(|| CommError::MalformedTopic {
            topic: topic.to_string(),
            reason: format!("unknown event level {level_str:?}"),
        })?;
        let subject = if event_level == EventLevel::Iov {
            Subject::Route(levels[4].to_string())
        } else {
            let id = Uuid::parse_str(levels[4]).map_err(|_| CommError::MalformedTopic {
                topic: topic.to_string(),
                reason: "subject is not a valid UUID".into(),
            })?;
            Subject::Agent(id)
        };
        let correlation_id = if levels.len() == 6 {
            Some(Uuid::parse_str(levels[5]).map_err(|_| CommError::MalformedTopic {
                topic: topic.to_string(),
                reason: "correlation id is not a valid UUID".into(),
            })?)
        } else {
            None
        };
        Topic::new(namespace, event_level, filter, subject, correlation_id)
    }
}

/// Any topic string that does not start with `coaty/`.
pub fn is_raw_topic(topic: &str) -> bool {
    !topic.starts_with("coaty/")
}

/// Whether `topic` may legally be used as the target of a publish, whether
/// a coaty event topic or a raw one: every level must be non-empty and
/// must not contain `#` or `+`, and the whole topic must fit in 65535
/// UTF-8 bytes.
pub fn is_valid_publication_topic(topic: &str) -> bool {
    if topic.as_bytes().len() > MAX_TOPIC_BYTES || topic.contains('\u{0}') {
        return false;
    }
    topic.split('/').all(|level| !level.contains(['#', '+']))
        && !topic.is_empty()
        && topic.split('/').all(|level| !level.is_empty())
}

/// Whether `topic` is a well-formed `IOV` topic, i.e. `coaty/<v>/<ns>/IOV/<route>`.
pub fn is_valid_io_value_topic(topic: &str) -> bool {
    match Topic::decode(topic) {
        Ok(t) => t.event_level == EventLevel::Iov,
        Err(_) => false,
    }
}

/// Subscription filter: mirrors [`Topic::encode`] but substitutes `+` for
/// levels that are unknown at subscribe time.
pub struct TopicFilter;

impl TopicFilter {
    /// Filter for subscribing to a one-way or inbound-request event type.
    /// `namespace` may be `None` to request a namespace wildcard (requires
    /// `shouldEnableCrossNamespacing`).
    pub fn for_request(
        namespace: Option<&str>,
        event_level: EventLevel,
        event_type_filter: Option<&str>,
    ) -> String {
        let ns = namespace.unwrap_or("+");
        let mut level = event_level.as_str().to_string();
        if let Some(f) = event_type_filter {
            level.push(':');
            level.push_str(f);
        }
        format!("coaty/{}/{}/{}/+", PROTOCOL_VERSION, ns, level)
    }

    /// Filter for subscribing to the responses of a specific two-way
    /// request, keyed by `correlation_id`.
    pub fn for_response(
        namespace: &str,
        event_level: EventLevel,
        correlation_id: Uuid,
    ) -> String {
        format!(
            "coaty/{}/{}/{}/+/{}",
            PROTOCOL_VERSION,
            namespace,
            event_level.as_str(),
            correlation_id
        )
    }

    /// Filter for subscribing to a single IO route.
    pub fn for_route(namespace: &str, route: &str) -> String {
        format!("coaty/{}/{}/IOV/{}", PROTOCOL_VERSION, namespace, route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_level_rejects_reserved_chars() {
        assert!(is_valid_topic_level("foo"));
        assert!(!is_valid_topic_level(""));
        assert!(!is_valid_topic_level("a/b"));
        assert!(!is_valid_topic_level("a+b"));
        assert!(!is_valid_topic_level("a#b"));
        assert!(!is_valid_topic_level("a\u{0}b"));
    }

    #[test]
    fn round_trip_one_way_advertise() {
        let id = Uuid::new_v4();
        let topic = Topic::new(
            "testns",
            EventLevel::Adv,
            Some("Identity".to_string()),
            Subject::Agent(id),
            None,
        )
        .unwrap();
        let encoded = topic.encode();
        let decoded = Topic::decode(&encoded).unwrap();
        assert_eq!(topic, decoded);
    }

    #[test]
    fn round_trip_two_way_discover() {
        let id = Uuid::new_v4();
        let cid = Uuid::new_v4();
        let topic = Topic::new("-", EventLevel::Dsc, None, Subject::Agent(id), Some(cid)).unwrap();
        let decoded = Topic::decode(&topic.encode()).unwrap();
        assert_eq!(topic, decoded);
    }

    #[test]
    fn one_way_rejects_correlation_id() {
        let id = Uuid::new_v4();
        let cid = Uuid::new_v4();
        assert!(Topic::new("-", EventLevel::Dad, None, Subject::Agent(id), Some(cid)).is_err());
    }

    #[test]
    fn two_way_requires_correlation_id() {
        let id = Uuid::new_v4();
        assert!(Topic::new("-", EventLevel::Qry, None, Subject::Agent(id), None).is_err());
    }

    #[test]
    fn raw_topic_detection() {
        assert!(is_raw_topic("sensors/temp"));
        assert!(!is_raw_topic("coaty/1/-/ADV/abc"));
    }

    #[test]
    fn io_value_topic_uses_route_subject() {
        let topic = Topic::new(
            "-",
            EventLevel::Iov,
            None,
            Subject::Route("route-1".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(topic.encode(), "coaty/1/-/IOV/route-1");
        assert!(is_valid_io_value_topic(&topic.encode()));
    }

    #[test]
    fn request_filter_wildcards_subject() {
        let f = TopicFilter::for_request(Some("-"), EventLevel::Dsc, None);
        assert_eq!(f, "coaty/1/-/DSC/+");
    }
}
