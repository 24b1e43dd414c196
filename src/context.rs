use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use minijinja::value::{from_args, Enumerator, Object, Value};
use minijinja::{context, Error, ErrorKind, State};

use crate::message::HeaderMap;

/// The data a template is rendered against.
///
/// Built from a session once its message has been received
/// and never changed afterwards.
#[derive(Clone, Debug)]
pub struct RenderContext {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub recipients: Vec<String>,
    /// The message exactly as received.
    pub data: String,
    pub headers: HeaderMap,
    /// Everything after the header block.
    pub body: String,
}

impl RenderContext {
    /// A fully populated context used to try out templates
    /// before any mail has arrived.
    pub fn sample() -> Self {
        let headers: HeaderMap = [
            ("Subject", "Sample subject"),
            ("From", "Sample Sender <sender@example.com>"),
            ("To", "Sample Recipient <recipient@example.com>"),
            ("Message-ID", "<sample@example.com>"),
        ]
        .into_iter()
        .collect();
        let body = "Sample body.\r\nSecond line.\r\n".to_string();
        let data = format!(
            "Subject: Sample subject\r\n\
             From: Sample Sender <sender@example.com>\r\n\
             To: Sample Recipient <recipient@example.com>\r\n\
             Message-ID: <sample@example.com>\r\n\r\n{body}"
        );
        RenderContext {
            id: "00000000-0000-4000-8000-000000000000".to_string(),
            timestamp: Utc
                .timestamp_opt(0, 0)
                .single()
                .unwrap_or_else(Utc::now),
            sender: "sender@example.com".to_string(),
            recipients: vec![
                "recipient@example.com".to_string(),
                "other@example.com".to_string(),
            ],
            data,
            headers,
            body,
        }
    }

    /// The receipt time as RFC 3339 in UTC, to the second.
    pub fn rfc3339(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub(crate) fn to_value(&self) -> Value {
        context! {
            id => self.id,
            timestamp => self.rfc3339(),
            timestamp_unix => self.timestamp.timestamp(),
            sender => self.sender,
            recipients => self.recipients,
            data => self.data,
            headers => Value::from_object(self.headers.clone()),
            body => self.body,
        }
    }
}

// Missing headers render as an empty string rather than undefined,
// so templates stay valid under strict undefined handling.
impl Object for HeaderMap {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        Some(Value::from(self.get(name).unwrap_or_default()))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.names().map(Value::from).collect())
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "get" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(Value::from(self.get(name).unwrap_or_default()))
            }
            "get_all" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(Value::from(self.get_all(name).to_vec()))
            }
            "contains" => {
                let (name,): (&str,) = from_args(args)?;
                Ok(Value::from(self.contains(name)))
            }
            _ => Err(Error::from(ErrorKind::UnknownMethod)),
        }
    }
}
