//! Canonical record and the index operation built from it.
//!
//! A record is what the normalizer produces and what the queue stores; an operation is
//! the `(index, body)` pair handed to the bulk sink once a record is finalized.

use chrono::{DateTime, Datelike, FixedOffset, SecondsFormat, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix for flattened `extra` keys so they never collide with named fields.
pub const EXTRA_PREFIX: &str = "x_";

/// Correlation id used when the line carries none.
pub const NO_CRID: &str = "-";

/// One normalized log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<FixedOffset>,
    pub hostname: String,
    pub env: String,
    pub project: String,
    pub topic: String,
    pub crid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub keyword: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    /// Timestamp came from an absolute JSON field; skip the configured offset.
    #[serde(default)]
    pub no_time_offset: bool,
}

/// How records map to index names and timestamps at dispatch time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSettings {
    /// Hours added to line timestamps (log files usually carry local time without zone).
    pub time_offset_hours: i64,
    /// Index name is `topic-env-YYYY-MM-DD` instead of `topic-YYYY-MM-DD`.
    pub include_env: bool,
}

/// Destination index plus document body, ready for a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub index: String,
    pub body: Value,
}

impl Record {
    /// Timestamp after applying the configured offset (unless the record opted out).
    pub fn effective_timestamp(&self, settings: &IndexSettings) -> DateTime<FixedOffset> {
        if self.no_time_offset || settings.time_offset_hours == 0 {
            return self.timestamp;
        }
        // unrepresentable offsets leave the line time unchanged
        TimeDelta::try_hours(settings.time_offset_hours)
            .and_then(|d| self.timestamp.checked_add_signed(d))
            .unwrap_or(self.timestamp)
    }

    pub fn index_name(&self, settings: &IndexSettings) -> String {
        let ts = self.effective_timestamp(settings);
        if settings.include_env && !self.env.is_empty() {
            format!(
                "{}-{}-{:04}-{:02}-{:02}",
                self.topic,
                self.env,
                ts.year(),
                ts.month(),
                ts.day()
            )
        } else {
            format!(
                "{}-{:04}-{:02}-{:02}",
                self.topic,
                ts.year(),
                ts.month(),
                ts.day()
            )
        }
    }

    /// Flat document: extra keys first (prefixed), then the named fields.
    pub fn document(&self, settings: &IndexSettings) -> Value {
        let mut out = Map::with_capacity(self.extra.len() + 8);
        for (k, v) in &self.extra {
            out.insert(format!("{}{}", EXTRA_PREFIX, k), v.clone());
        }
        out.insert(
            "timestamp".to_string(),
            Value::String(
                self.effective_timestamp(settings)
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        out.insert("hostname".to_string(), Value::String(self.hostname.clone()));
        out.insert("env".to_string(), Value::String(self.env.clone()));
        out.insert("project".to_string(), Value::String(self.project.clone()));
        out.insert("topic".to_string(), Value::String(self.topic.clone()));
        out.insert("crid".to_string(), Value::String(self.crid.clone()));
        if !self.keyword.is_empty() {
            out.insert("keyword".to_string(), Value::String(self.keyword.clone()));
        }
        if !self.message.is_empty() {
            out.insert("message".to_string(), Value::String(self.message.clone()));
        }
        Value::Object(out)
    }

    pub fn to_operation(&self, settings: &IndexSettings) -> Operation {
        Operation {
            index: self.index_name(settings),
            body: self.document(settings),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample() -> Record {
        Record {
            timestamp: Utc
                .with_ymd_and_hms(2018, 4, 11, 23, 23, 13)
                .unwrap()
                .fixed_offset(),
            hostname: "h1".to_string(),
            env: "prod".to_string(),
            project: "billing".to_string(),
            topic: "dummy-topic".to_string(),
            crid: NO_CRID.to_string(),
            keyword: String::new(),
            message: "hello".to_string(),
            extra: Map::new(),
            no_time_offset: false,
        }
    }

    #[test]
    fn index_name_by_topic_and_day() {
        let r = sample();
        assert_eq!(r.index_name(&IndexSettings::default()), "dummy-topic-2018-04-11");
        let with_env = IndexSettings {
            include_env: true,
            ..Default::default()
        };
        assert_eq!(r.index_name(&with_env), "dummy-topic-prod-2018-04-11");
    }

    #[test]
    fn time_offset_moves_the_day() {
        let r = sample();
        let settings = IndexSettings {
            time_offset_hours: 1,
            include_env: false,
        };
        assert_eq!(r.index_name(&settings), "dummy-topic-2018-04-12");
        let doc = r.document(&settings);
        assert_eq!(doc["timestamp"], "2018-04-12T00:23:13.000Z");
    }

    #[test]
    fn absolute_timestamp_ignores_offset() {
        let mut r = sample();
        r.no_time_offset = true;
        let settings = IndexSettings {
            time_offset_hours: -8,
            include_env: false,
        };
        assert_eq!(r.effective_timestamp(&settings), r.timestamp);
        assert_eq!(r.index_name(&settings), "dummy-topic-2018-04-11");
    }

    #[test]
    fn unrepresentable_offset_keeps_line_time() {
        let r = sample();
        for hours in [i64::MAX, i64::MIN, 2_400_000_000] {
            let settings = IndexSettings {
                time_offset_hours: hours,
                include_env: false,
            };
            assert_eq!(r.effective_timestamp(&settings), r.timestamp);
            assert_eq!(r.index_name(&settings), "dummy-topic-2018-04-11");
        }
    }

    #[test]
    fn document_prefixes_extra_and_omits_empty_fields() {
        let mut r = sample();
        r.message.clear();
        r.extra.insert("duration".to_string(), Value::from(20));
        r.extra.insert("topic".to_string(), Value::from("shadow"));
        let doc = r.document(&IndexSettings::default());
        assert_eq!(doc["x_duration"], 20);
        assert_eq!(doc["x_topic"], "shadow");
        assert_eq!(doc["topic"], "dummy-topic");
        assert!(doc.get("message").is_none());
        assert!(doc.get("keyword").is_none());
        assert_eq!(doc["crid"], "-");
    }

    #[test]
    fn record_json_keeps_offset_flag() {
        let mut r = sample();
        r.no_time_offset = true;
        r.keyword = "a,b".to_string();
        let s = serde_json::to_string(&r).unwrap();
        let back: Record = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }
}
