use anyhow::Context as _;
use rand::RngCore as _;
use rand::rngs::OsRng;
use serde::Serialize;
use time::OffsetDateTime;

use crate::base32::to_base32;

/// Protocol front-end that observed an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Receiver {
    #[serde(rename = "DNS")]
    Dns,
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
}

/// A recorded inbound interaction that matched a known test ID.
///
/// Owned by exactly one test inside the storage; the API hands out detached
/// copies only.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(rename = "testID")]
    pub test_id: String,
    pub receiver: Receiver,
    #[serde(rename = "remoteAddress", skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dump: String,
    #[serde(rename = "queryType", skip_serializing_if = "String::is_empty")]
    pub query_type: String,
}

impl Event {
    /// Builds an event with a fresh random ID and the current wall-clock time.
    pub fn new(
        test_id: impl Into<String>,
        receiver: Receiver,
        remote_addr: impl Into<String>,
        dump: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: generate_event_id()?,
            time: OffsetDateTime::now_utc(),
            test_id: test_id.into(),
            receiver,
            remote_addr: remote_addr.into(),
            dump: dump.into(),
            query_type: String::new(),
        })
    }

    /// Like [`Event::new`], additionally recording the DNS query type.
    pub fn new_dns(
        test_id: impl Into<String>,
        remote_addr: impl Into<String>,
        dump: impl Into<String>,
        query_type: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let mut event = Self::new(test_id, Receiver::Dns, remote_addr, dump)?;
        event.query_type = query_type.into();
        Ok(event)
    }
}

/// 16 bytes from the OS CSPRNG, base32-lowercased (26 characters).
///
/// Collisions within a single test are not specifically prevented.
fn generate_event_id() -> anyhow::Result<String> {
    let mut random = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut random)
        .context("OS random source failed")?;
    Ok(to_base32(&random))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn event_ids_are_26_chars_and_distinct() {
        let a = Event::new("test", Receiver::Http, "127.0.0.1:1234", "dump").expect("event");
        let b = Event::new("test", Receiver::Http, "127.0.0.1:1234", "dump").expect("event");
        assert_eq!(a.id.len(), 26);
        assert_eq!(b.id.len(), 26);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn json_uses_wire_field_names_and_omits_empty_fields() {
        let event = Event {
            id: "eventid".to_owned(),
            time: datetime!(2024-05-01 12:00:00.5 UTC),
            test_id: "testid".to_owned(),
            receiver: Receiver::Dns,
            remote_addr: "198.51.100.1:53124".to_owned(),
            dump: String::new(),
            query_type: "A".to_owned(),
        };

        let value = serde_json::to_value(&event).expect("serializable");
        let object = value.as_object().expect("object");

        assert_eq!(object["id"], "eventid");
        assert_eq!(object["testID"], "testid");
        assert_eq!(object["receiver"], "DNS");
        assert_eq!(object["remoteAddress"], "198.51.100.1:53124");
        assert_eq!(object["queryType"], "A");
        assert_eq!(object["time"], "2024-05-01T12:00:00.5Z");
        assert!(!object.contains_key("dump"));
    }
}
