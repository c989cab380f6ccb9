//! Dispatcher wire format.
//!
//! The dispatcher is loose about types: flags arrive as booleans or as the
//! strings `"true"`/`"false"`, numbers as numbers or strings, and the class
//! removal list as a JSON array serialized into a string. Everything is
//! normalized here so the rest of the node only sees [`Job`].

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ElementWait, HttpMethod, Job, JobClass, JobParams, Passthrough};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Crawl,
    Heartbeat,
    Batch,
}

/// One inbound message, as sent by the dispatcher.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(rename = "type", default = "default_event")]
    pub event: EventType,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub wait_secs: u64,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub save_html: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub save_markdown: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub save_text: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub visualize: bool,
    #[serde(default, deserialize_with = "string_list")]
    pub remove_selectors: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub remove_classes: Vec<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub remove_images: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub fast_lane: bool,
    #[serde(default, deserialize_with = "element_wait")]
    pub wait_for_element: Option<ElementWait>,
    #[serde(default)]
    pub transform_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub trigger_download: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub skip_headers: bool,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub batch: bool,
    #[serde(default)]
    pub batch_id: Option<String>,
}

fn default_event() -> EventType {
    EventType::Crawl
}

/// How the channel treats a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Heartbeat,
    /// Standard crawl. Counts against the daily budget.
    Crawl(Job),
    /// Raw GET/POST. Not rate limited.
    Passthrough(Job),
    /// Part of a dispatcher batch. Not rate limited.
    Batch(Job),
}

impl Classified {
    pub fn kind(&self) -> &'static str {
        match self {
            Classified::Heartbeat => "heartbeat",
            Classified::Crawl(_) => "crawl",
            Classified::Passthrough(_) => "passthrough",
            Classified::Batch(_) => "batch",
        }
    }
}

/// Parse and classify one text frame.
pub fn classify(text: &str) -> Result<Classified> {
    let message: InboundMessage = serde_json::from_str(text)?;
    message.classify()
}

impl InboundMessage {
    pub fn classify(self) -> Result<Classified> {
        if self.event == EventType::Heartbeat {
            return Ok(Classified::Heartbeat);
        }
        let batch = self.event == EventType::Batch || self.batch;
        let passthrough = self.method.map(|method| Passthrough {
            method,
            payload: self.payload.clone(),
            headers: self.headers.clone(),
        });
        let job = self.into_job(batch)?;

        Ok(match passthrough {
            Some(pt) => Classified::Passthrough(job.passthrough(pt)),
            None if batch => Classified::Batch(job),
            None => Classified::Crawl(job),
        })
    }

    fn into_job(self, batch: bool) -> Result<Job> {
        let id = self
            .job_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Protocol("job message without jobId".to_string()))?;
        let url = self
            .url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Protocol(format!("job {id} has no url")))?;

        let params = JobParams {
            wait_secs: self.wait_secs,
            save_html: self.save_html,
            save_markdown: self.save_markdown,
            save_text: self.save_text,
            visualize: self.visualize,
            remove_selectors: self.remove_selectors,
            remove_classes: self.remove_classes,
            remove_images: self.remove_images,
            fast_lane: self.fast_lane,
            element_wait: self.wait_for_element,
            transform_id: self.transform_id,
            org_id: self.org_id,
            sandbox: self.sandbox.filter(|s| !s.is_empty()),
            trigger_download: self.trigger_download,
            skip_headers: self.skip_headers,
            batch_id: self.batch_id,
        };
        let class = if batch {
            JobClass::Batch
        } else {
            JobClass::Interactive
        };
        Ok(Job::new(id, url).class(class).params(params))
    }
}

// ---------------------------------------------------------------------------
// Lenient field decoding
// ---------------------------------------------------------------------------

fn flexible_bool<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_u64().is_some_and(|n| n != 0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            other => Err(de::Error::custom(format!("not a boolean: {other:?}"))),
        },
        other => Err(de::Error::custom(format!("not a boolean: {other}"))),
    }
}

fn flexible_u64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("not a non-negative integer: {n}"))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| de::Error::custom(format!("bad integer {s:?}: {e}"))),
        other => Err(de::Error::custom(format!("not an integer: {other}"))),
    }
}

/// A list given either as a JSON array or as a JSON array serialized into a
/// string. A plain non-JSON string becomes a single-item list.
fn string_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
    let value = Value::deserialize(d)?;
    let value = match value {
        Value::String(s) if s.trim().is_empty() => return Ok(Vec::new()),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ Value::Array(_)) => parsed,
            _ => return Ok(vec![s]),
        },
        other => other,
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(de::Error::custom(format!("list item is not a string: {other}"))),
            })
            .collect(),
        other => Err(de::Error::custom(format!("not a list: {other}"))),
    }
}

/// `"none"` or empty means no wait; a string is a selector; an object may
/// also carry a timeout.
fn element_wait<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<ElementWait>, D::Error> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WaitObject {
        selector: String,
        #[serde(default, deserialize_with = "flexible_u64")]
        timeout_secs: u64,
    }

    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("none") => Ok(None),
        Value::String(selector) => Ok(Some(ElementWait {
            selector,
            timeout_secs: None,
        })),
        wait @ Value::Object(_) => {
            let wait: WaitObject = serde_json::from_value(wait).map_err(de::Error::custom)?;
            if wait.selector.eq_ignore_ascii_case("none") {
                return Ok(None);
            }
            Ok(Some(ElementWait {
                selector: wait.selector,
                timeout_secs: (wait.timeout_secs > 0).then_some(wait.timeout_secs),
            }))
        }
        other => Err(de::Error::custom(format!("bad element wait: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_recognized_without_job_fields() {
        assert_eq!(classify(r#"{"type":"heartbeat"}"#).unwrap(), Classified::Heartbeat);
    }

    #[test]
    fn string_flags_and_serialized_lists_are_normalized() {
        let text = r#"{
            "type": "crawl",
            "jobId": "j1",
            "url": "https://example.com/",
            "waitSecs": "5",
            "saveMarkdown": "true",
            "saveText": "false",
            "removeClasses": "[\"ad\",\"banner\"]",
            "waitForElement": "none"
        }"#;
        let Classified::Crawl(job) = classify(text).unwrap() else {
            panic!("expected crawl");
        };
        assert_eq!(job.params.wait_secs, 5);
        assert!(job.params.save_markdown);
        assert!(!job.params.save_text);
        assert_eq!(job.params.remove_classes, vec!["ad", "banner"]);
        assert_eq!(job.params.element_wait, None);
        assert_eq!(job.class, JobClass::Interactive);
    }

    #[test]
    fn method_makes_a_passthrough() {
        let text = r#"{"jobId":"p1","url":"https://api.example.com/","method":"POST","payload":"{}"}"#;
        let Classified::Passthrough(job) = classify(text).unwrap() else {
            panic!("expected passthrough");
        };
        let pt = job.passthrough.unwrap();
        assert_eq!(pt.method, HttpMethod::Post);
        assert_eq!(pt.payload.as_deref(), Some("{}"));
    }

    #[test]
    fn batch_flag_or_event_selects_batch_class() {
        for text in [
            r#"{"type":"batch","jobId":"b1","url":"https://example.com/"}"#,
            r#"{"type":"crawl","batch":"true","batchId":"x","jobId":"b1","url":"https://example.com/"}"#,
        ] {
            let Classified::Batch(job) = classify(text).unwrap() else {
                panic!("expected batch for {text}");
            };
            assert_eq!(job.class, JobClass::Batch);
        }
    }

    #[test]
    fn missing_job_id_is_a_protocol_error() {
        let err = classify(r#"{"type":"crawl","url":"https://example.com/"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
