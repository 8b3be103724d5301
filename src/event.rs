//! Raw shipper events and their normalization into [`Record`]s.
//!
//! The source path carries routing metadata (`.../env/topic/project.ext`); the message
//! carries a `[YYYY/MM/DD HH:MM:SS.mmm]` prefix followed by either free text with inline
//! marks or, for the `_json_` topic, a JSON object.

use crate::line::{self, MarkSpec};
use crate::record::{NO_CRID, Record};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Topic meaning "the message body is JSON, the real topic is inside it".
pub const JSON_TOPIC: &str = "_json_";

const CRID_MARK: MarkSpec<'static> = MarkSpec {
    names: &["CRID"],
    combine: false,
    separator: "",
};

const KEYWORD_MARK: MarkSpec<'static> = MarkSpec {
    names: &["K", "KW", "KEYWORD"],
    combine: true,
    separator: ",",
};

/// One event as pushed by a log shipper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub hostname: String,
    pub message: String,
    pub source: String,
}

/// JSON envelope: filebeat 6 (`beat.hostname`, `source`) and 7+ (`host.name`, `log.file.path`).
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    beat: Option<NameInfo>,
    #[serde(default)]
    host: Option<NameInfo>,
    #[serde(default)]
    agent: Option<NameInfo>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    log: Option<LogInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct NameInfo {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LogInfo {
    #[serde(default)]
    file: Option<LogFileInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct LogFileInfo {
    #[serde(default)]
    path: Option<String>,
}

impl RawEvent {
    /// Decode the shipper's JSON envelope.
    pub fn from_json(raw: &[u8]) -> serde_json::Result<Self> {
        let env: Envelope = serde_json::from_slice(raw)?;
        let hostname = env
            .beat
            .and_then(|b| b.hostname)
            .or_else(|| env.host.and_then(|h| h.name.or(h.hostname)))
            .or_else(|| env.agent.and_then(|a| a.hostname.or(a.name)))
            .unwrap_or_default();
        let source = env
            .source
            .or_else(|| env.log.and_then(|l| l.file).and_then(|f| f.path))
            .unwrap_or_default();
        Ok(Self {
            hostname,
            message: env.message,
            source,
        })
    }
}

/// Why an event could not be normalized. The event is dropped either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeError {
    SourcePath,
    TimestampPrefix,
    JsonPayload,
    JsonTopic,
    JsonTimestamp,
}

impl NormalizeError {
    /// Short label for logs and the dropped-records metric.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SourcePath => "bad_source",
            Self::TimestampPrefix => "bad_timestamp",
            Self::JsonPayload => "bad_json",
            Self::JsonTopic => "missing_topic",
            Self::JsonTimestamp => "bad_json_timestamp",
        }
    }
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::SourcePath => "source path has fewer than 3 segments",
            Self::TimestampPrefix => "message does not start with [YYYY/MM/DD HH:MM:SS.mmm]",
            Self::JsonPayload => "message body is not a JSON object",
            Self::JsonTopic => "JSON body has no string topic",
            Self::JsonTimestamp => "JSON timestamp is not RFC 3339",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NormalizeError {}

/// Normalize one raw event. Pure: the same input always yields the same record.
pub fn normalize(event: &RawEvent) -> Result<Record, NormalizeError> {
    let (env, topic, project) = decode_source(&event.source)?;

    let (timestamp, body) = line::bracketed_timestamp(line::trim(&event.message))
        .ok_or(NormalizeError::TimestampPrefix)?;

    let mut record = Record {
        timestamp: timestamp.fixed_offset(),
        hostname: event.hostname.clone(),
        env,
        project,
        topic,
        crid: NO_CRID.to_string(),
        keyword: String::new(),
        message: String::new(),
        extra: Map::new(),
        no_time_offset: false,
    };

    if record.topic == JSON_TOPIC {
        decode_json_body(line::trim(body), &mut record)?;
    } else {
        decode_text_body(line::trim(body), &mut record);
    }
    Ok(record)
}

/// `.../env/topic/project.ext` → (env, topic, project).
fn decode_source(raw: &str) -> Result<(String, String, String), NormalizeError> {
    let segments: Vec<&str> = raw.trim().split('/').collect();
    let [.., env, topic, file] = segments.as_slice() else {
        return Err(NormalizeError::SourcePath);
    };
    let project = file.split('.').next().unwrap_or_default();
    Ok((env.to_string(), topic.to_string(), project.to_string()))
}

fn decode_text_body(body: &str, record: &mut Record) {
    let (rest, crid) = line::extract_marks(body, &CRID_MARK);
    let (rest, keyword) = line::extract_marks(&rest, &KEYWORD_MARK);
    if let Some(crid) = crid {
        record.crid = crid;
    }
    record.keyword = keyword.unwrap_or_default();
    record.message = line::trim(&rest).to_string();
}

fn decode_json_body(body: &str, record: &mut Record) -> Result<(), NormalizeError> {
    let mut extra = line::decode_json_object(body).ok_or(NormalizeError::JsonPayload)?;

    record.topic = take_str(&mut extra, "topic").ok_or(NormalizeError::JsonTopic)?;
    if let Some(project) = take_str(&mut extra, "project") {
        record.project = project;
    }
    if let Some(crid) = take_str(&mut extra, "crid") {
        record.crid = crid;
    }
    if let Some(ts) = take_timestamp(&mut extra)? {
        record.timestamp = ts;
        record.no_time_offset = true;
    }

    record.extra = extra;
    record.message.clear();
    Ok(())
}

/// Remove `key` and return its trimmed value when it is a non-empty string.
fn take_str(m: &mut Map<String, Value>, key: &str) -> Option<String> {
    match m.remove(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        _ => None,
    }
}

fn take_timestamp(
    m: &mut Map<String, Value>,
) -> Result<Option<DateTime<FixedOffset>>, NormalizeError> {
    match m.remove("timestamp") {
        None => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s.trim())
            .map(Some)
            .map_err(|_| NormalizeError::JsonTimestamp),
        Some(_) => Err(NormalizeError::JsonTimestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(source: &str, message: &str) -> RawEvent {
        RawEvent {
            hostname: "h1".to_string(),
            message: message.to_string(),
            source: source.to_string(),
        }
    }

    #[test]
    fn free_text_with_crid() {
        let r = normalize(&event(
            "/a/env1/topicA/proj1.log",
            "[2020/01/02 03:04:05.006] CRID[xyz] hello",
        ))
        .unwrap();
        assert_eq!(r.hostname, "h1");
        assert_eq!(r.env, "env1");
        assert_eq!(r.topic, "topicA");
        assert_eq!(r.project, "proj1");
        assert_eq!(r.crid, "xyz");
        assert_eq!(r.message, "hello");
        assert_eq!(r.keyword, "");
        assert!(r.extra.is_empty());
        assert_eq!(
            r.timestamp,
            Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::milliseconds(6)
        );
        assert!(!r.no_time_offset);
    }

    #[test]
    fn free_text_defaults_and_keywords() {
        let r = normalize(&event(
            "/tmp/test2/test3/test1.20180719.log",
            "  [2018/07/20 15:03:00.000] K[a] hello KW[b] world KEYWORD[c,d]  ",
        ))
        .unwrap();
        assert_eq!(r.crid, "-");
        assert_eq!(r.keyword, "a,b,c,d");
        assert_eq!(r.project, "test1");
        assert_eq!(r.message, "hello  world");
    }

    #[test]
    fn multiline_message_keeps_body() {
        let r = normalize(&event(
            "/tmp/test2/test3/test1.log",
            "[2018/07/20 15:03:00.000] hello world CRID[aaa]\nbbb",
        ))
        .unwrap();
        assert_eq!(r.crid, "aaa");
        assert_eq!(r.message, "hello world \nbbb");
    }

    #[test]
    fn json_body_promotes_topic() {
        let r = normalize(&event(
            "/a/env2/_json_/proj2.log",
            r#"[2020/01/02 03:04:05.006] {"topic":"real-topic","duration":5}"#,
        ))
        .unwrap();
        assert_eq!(r.topic, "real-topic");
        assert_eq!(r.project, "proj2");
        assert_eq!(r.env, "env2");
        assert_eq!(r.message, "");
        assert_eq!(r.extra.len(), 1);
        assert_eq!(r.extra["duration"], 5);
        // no timestamp key in the body: the bracketed line time stands
        assert_eq!(
            r.timestamp,
            Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap() + chrono::Duration::milliseconds(6)
        );
        assert_eq!(r.timestamp.offset().local_minus_utc(), 0);
        assert!(!r.no_time_offset);
    }

    #[test]
    fn json_body_promotes_all_known_keys() {
        let r = normalize(&event(
            "/var/log/test/_json_/dummy-project.log",
            r#"[2020/01/02 03:04:05.006] {"topic":"t","project":"p","crid":"12345","timestamp":"2020-01-01T08:00:00+08:00","k":{"a":1}}"#,
        ))
        .unwrap();
        assert_eq!(r.topic, "t");
        assert_eq!(r.project, "p");
        assert_eq!(r.crid, "12345");
        assert!(r.no_time_offset);
        assert_eq!(r.timestamp.offset().local_minus_utc(), 8 * 3600);
        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        for key in ["topic", "project", "crid", "timestamp"] {
            assert!(!r.extra.contains_key(key), "{} left in extra", key);
        }
        assert_eq!(r.extra["k"]["a"], 1);
    }

    #[test]
    fn json_body_drops_non_string_known_keys() {
        let r = normalize(&event(
            "/a/b/_json_/p.log",
            r#"[2020/01/02 03:04:05.006] {"topic":"t","project":7,"crid":""}"#,
        ))
        .unwrap();
        assert_eq!(r.project, "p");
        assert_eq!(r.crid, "-");
        assert!(r.extra.is_empty());
    }

    #[test]
    fn json_body_failures() {
        let cases = [
            (r#"{"duration":5}"#, NormalizeError::JsonTopic),
            (r#"{"topic":5}"#, NormalizeError::JsonTopic),
            (r#"{"topic":"  "}"#, NormalizeError::JsonTopic),
            (r#"{"topic":"t","timestamp":"yesterday"}"#, NormalizeError::JsonTimestamp),
            (r#"{"topic":"t","timestamp":1}"#, NormalizeError::JsonTimestamp),
            ("not json", NormalizeError::JsonPayload),
        ];
        for (body, want) in cases {
            let msg = format!("[2020/01/02 03:04:05.006] {}", body);
            assert_eq!(normalize(&event("/a/b/_json_/p.log", &msg)), Err(want), "{}", body);
        }
    }

    #[test]
    fn short_source_path_fails() {
        let msg = "[2020/01/02 03:04:05.006] hi";
        assert_eq!(normalize(&event("a/b", msg)), Err(NormalizeError::SourcePath));
        assert_eq!(normalize(&event("", msg)), Err(NormalizeError::SourcePath));
        let r = normalize(&event("e/t/p", msg)).unwrap();
        assert_eq!((r.env.as_str(), r.topic.as_str(), r.project.as_str()), ("e", "t", "p"));
    }

    #[test]
    fn missing_timestamp_fails() {
        assert_eq!(
            normalize(&event("/a/b/c.log", "2018/07/20 15:03:00.000 hello")),
            Err(NormalizeError::TimestampPrefix)
        );
        assert_eq!(
            normalize(&RawEvent::default()),
            Err(NormalizeError::SourcePath)
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        let e = event("/a/e/t/p.log", "[2020/01/02 03:04:05.006] K[x] CRID[c] body");
        assert_eq!(normalize(&e), normalize(&e));
    }

    #[test]
    fn envelope_layouts() {
        let v6 = br#"{"source":"/tmp/a/b/c.log","message":"m","beat":{"hostname":"test.test"}}"#;
        let e = RawEvent::from_json(v6).unwrap();
        assert_eq!(e.hostname, "test.test");
        assert_eq!(e.source, "/tmp/a/b/c.log");
        assert_eq!(e.message, "m");

        let v7 = br#"{"log":{"file":{"path":"/x/e/t/p.log"}},"message":"m","host":{"name":"n1"}}"#;
        let e = RawEvent::from_json(v7).unwrap();
        assert_eq!(e.hostname, "n1");
        assert_eq!(e.source, "/x/e/t/p.log");

        assert!(RawEvent::from_json(b"aaaaa").is_err());
    }
}
