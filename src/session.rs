use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::context::RenderContext;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::message::{HeaderMap, Message, ParseError};
use crate::Config;

/// Where a session is in its mail exchange.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    /// Nothing received yet.
    Fresh,
    /// Sender known, collecting recipients.
    ReceivingEnvelope,
    /// Reading and delivering the message.
    ReceivingData,
    /// The message was posted.
    Dispatched,
    /// The message could not be parsed or posted.
    Failed,
    /// The client logged out.
    Ended,
}

/// An error during a mail exchange.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("{command} is not allowed in state {state:?}")]
    OutOfSequence {
        command: &'static str,
        state: State,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// The state of one SMTP connection.
///
/// Collects the envelope and message of an exchange
/// and posts it to the configured endpoint once the message is complete.
/// All log events are emitted inside a span carrying the session id.
#[derive(Debug)]
pub struct Session {
    config: Arc<Config>,
    dispatcher: Dispatcher,
    span: Span,
    state: State,
    sent: bool,
    id: String,
    timestamp: DateTime<Utc>,
    sender: String,
    recipients: Vec<String>,
    data: Option<String>,
    message: Option<Message>,
}

impl Session {
    /// Create a fresh session with a new id and timestamp.
    pub fn new(config: Arc<Config>, dispatcher: Dispatcher) -> Self {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("session", %id);
        span.in_scope(|| info!("new session"));
        Session {
            config,
            dispatcher,
            span,
            state: State::Fresh,
            sent: false,
            id,
            timestamp: Utc::now(),
            sender: String::new(),
            recipients: Vec::new(),
            data: None,
            message: None,
        }
    }

    /// Record the sender of the exchange (`MAIL FROM`).
    ///
    /// Any address is accepted.
    pub fn mail(&mut self, sender: &str) -> Result<(), SessionError> {
        let _enter = self.span.enter();
        self.expect(&[State::Fresh], "MAIL")?;
        info!(sender, "MAIL");
        self.sender = sender.to_string();
        self.state = State::ReceivingEnvelope;
        Ok(())
    }

    /// Add a recipient (`RCPT TO`).
    ///
    /// May be called any number of times,
    /// recipients are kept in order and duplicates are kept.
    pub fn rcpt(&mut self, recipient: &str) -> Result<(), SessionError> {
        let _enter = self.span.enter();
        self.expect(&[State::ReceivingEnvelope], "RCPT")?;
        info!(recipient, "RCPT");
        self.recipients.push(recipient.to_string());
        Ok(())
    }

    /// Read the message (`DATA`) and post it to the endpoint.
    ///
    /// Returns the status the endpoint answered with.
    /// A message that does not parse is never posted,
    /// and a failed post is not retried.
    pub async fn data(
        &mut self,
        reader: impl AsyncRead + Unpin,
    ) -> Result<StatusCode, SessionError> {
        let span = self.span.clone();
        let result = self.receive(reader).instrument(span.clone()).await;
        let _enter = span.enter();
        match &result {
            Ok(status) => {
                self.sent = true;
                self.state = State::Dispatched;
                info!(%status, "POST returned status");
            }
            Err(SessionError::Dispatch(error)) => {
                self.state = State::Failed;
                error!(?error, "POST failed");
            }
            Err(SessionError::OutOfSequence { .. }) => {
                error!("DATA out of sequence, refusing to post");
            }
            Err(error) => {
                self.state = State::Failed;
                error!(
                    ?error,
                    "could not read message (misbehaving sender?), \
                     refusing to post"
                );
            }
        }
        result
    }

    async fn receive(
        &mut self,
        mut reader: impl AsyncRead + Unpin,
    ) -> Result<StatusCode, SessionError> {
        self.expect(&[State::ReceivingEnvelope], "DATA")?;
        if self.recipients.is_empty() {
            return Err(SessionError::OutOfSequence {
                command: "DATA",
                state: self.state,
            });
        }
        self.state = State::ReceivingData;

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        info!("DATA: [redacted ({} bytes)]", raw.len());
        self.data = Some(String::from_utf8_lossy(&raw).into_owned());

        let message = Message::parse(&raw)?;
        if self.config.verbose() {
            let names: Vec<_> = message.headers().names().collect();
            info!(headers = ?names, "message parsed");
        } else {
            debug!(headers = message.headers().len(), "message parsed");
        }
        self.message = Some(message);

        let ctx = self.render_context();
        let status = self
            .dispatcher
            .post(self.config.templates(), self.config.endpoint(), &ctx)
            .await?;
        Ok(status)
    }

    /// Discard the exchange and start over
    /// with a new id and timestamp (`RSET`).
    pub fn reset(&mut self) {
        self.span.in_scope(|| {
            if self.sent {
                info!("session reset after POST");
            } else {
                info!("session reset without POST");
            }
        });
        *self = Session::new(self.config.clone(), self.dispatcher.clone());
    }

    /// End the session (`QUIT` or connection closed).
    ///
    /// The fields are kept so the session can still be inspected.
    pub fn logout(&mut self) {
        self.span.in_scope(|| {
            if self.sent {
                info!("session logout after POST");
            } else {
                info!("session logout without POST");
            }
        });
        self.state = State::Ended;
    }

    /// The data templates are rendered against.
    pub fn render_context(&self) -> RenderContext {
        let (headers, body) = match &self.message {
            Some(message) => {
                (message.headers().clone(), message.body().to_string())
            }
            None => (HeaderMap::new(), String::new()),
        };
        RenderContext {
            id: self.id.clone(),
            timestamp: self.timestamp,
            sender: self.sender.clone(),
            recipients: self.recipients.clone(),
            data: self.data.clone().unwrap_or_default(),
            headers,
            body,
        }
    }

    fn expect(
        &self,
        states: &[State],
        command: &'static str,
    ) -> Result<(), SessionError> {
        if states.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::OutOfSequence {
                command,
                state: self.state,
            })
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the message of this exchange was posted.
    pub fn is_dispatched(&self) -> bool {
        self.sent
    }

    pub fn is_ended(&self) -> bool {
        self.state == State::Ended
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// The message as received, once `DATA` has been read.
    pub fn data_raw(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// The parsed headers, once `DATA` has been parsed.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.message.as_ref().map(Message::headers)
    }

    /// The message body, once `DATA` has been parsed.
    pub fn body(&self) -> Option<&str> {
        self.message.as_ref().map(Message::body)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;

    use super::{Session, SessionError, State};
    use crate::dispatch::tests::{closed_address, stalled_address, Capture};
    use crate::dispatch::{Dispatcher, DEFAULT_TIMEOUT};
    use crate::message::ParseError;
    use crate::template::DEFAULT_TEMPLATE;
    use crate::Config;

    const MESSAGE: &str = "Subject: ON MY WAY
From: Gordon Freeman <freeman@materials.blackmesa.com>
To: Eli Vance <vance@materials.blackmesa.com>
Cc: Issac Kleiner <kleiner@materials.blackmesa.com>

hey guys running L8 2DAY
on the tram now";

    fn session_with_timeout(
        url: &str,
        template: &str,
        timeout: Duration,
    ) -> Session {
        let config =
            Config::new(url, &[] as &[&str], template, false).unwrap();
        let dispatcher = Dispatcher::new(timeout).unwrap();
        Session::new(Arc::new(config), dispatcher)
    }

    fn session_for(url: &str, template: &str) -> Session {
        session_with_timeout(url, template, DEFAULT_TIMEOUT)
    }

    async fn receive(session: &mut Session, data: &[u8]) {
        session.mail("me@host").unwrap();
        session.rcpt("you@host").unwrap();
        let _ = session.data(data).await;
    }

    fn assert_reset(session: &Session, previous: &str) {
        assert_ne!(session.id(), previous);
        assert_eq!(session.state(), State::Fresh);
        assert!(!session.is_dispatched());
        assert!(session.data_raw().is_none());
        assert!(session.headers().is_none());
        assert!(session.body().is_none());
    }

    fn session() -> Session {
        session_for("http://localhost", "{{ id }}")
    }

    #[test]
    fn new_session() {
        let session = session();
        assert!(!session.id().is_empty());
        assert_eq!(session.state(), State::Fresh);
        assert_eq!(session.sender(), "");
        assert!(session.recipients().is_empty());
        assert!(session.data_raw().is_none());
        assert!(session.headers().is_none());
        assert!(!session.is_dispatched());
    }

    #[test]
    fn mail_sets_sender() {
        let mut session = session();
        session.mail("me@host").unwrap();
        assert_eq!(session.sender(), "me@host");
        assert_eq!(session.state(), State::ReceivingEnvelope);
    }

    #[test]
    fn mail_accepts_any_address() {
        let mut session = session();
        session.mail("not an address at all").unwrap();
        assert_eq!(session.sender(), "not an address at all");
    }

    #[test]
    fn rcpt_appends_in_order() {
        let mut session = session();
        session.mail("me@host").unwrap();
        session.rcpt("a").unwrap();
        assert_eq!(session.recipients(), ["a"]);
        session.rcpt("b").unwrap();
        session.rcpt("a").unwrap();
        assert_eq!(session.recipients(), ["a", "b", "a"]);
    }

    #[test]
    fn rcpt_before_mail() {
        let mut session = session();
        let result = session.rcpt("a@host");
        assert!(matches!(
            result,
            Err(SessionError::OutOfSequence {
                command: "RCPT",
                state: State::Fresh
            })
        ));
        assert!(session.recipients().is_empty());
    }

    #[test]
    fn mail_twice() {
        let mut session = session();
        session.mail("me@host").unwrap();
        assert!(session.mail("other@host").is_err());
        assert_eq!(session.sender(), "me@host");
    }

    #[test]
    fn reset_refreshes_id() {
        let mut session = session();
        let mut ids = vec![session.id().to_string()];
        session.reset();
        ids.push(session.id().to_string());
        session.mail("from@host").unwrap();
        session.rcpt("to@host").unwrap();
        session.reset();
        ids.push(session.id().to_string());
        session.logout();
        session.reset();
        ids.push(session.id().to_string());

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(session.state(), State::Fresh);
        assert_eq!(session.sender(), "");
        assert!(session.recipients().is_empty());
    }

    #[tokio::test]
    async fn reset_after_exchange() {
        let mut capture = Capture::start(StatusCode::OK).await;
        let mut session = session_for(&capture.url(), "{{ id }}");
        receive(&mut session, MESSAGE.as_bytes()).await;
        assert_eq!(session.state(), State::Dispatched);
        capture.next().await;
        let previous = session.id().to_string();
        session.reset();
        assert_reset(&session, &previous);

        let address = closed_address().await;
        let mut session =
            session_for(&format!("http://{address}"), "{{ id }}");
        receive(&mut session, MESSAGE.as_bytes()).await;
        assert_eq!(session.state(), State::Failed);
        let previous = session.id().to_string();
        session.reset();
        assert_reset(&session, &previous);
    }

    #[test]
    fn logout_keeps_fields() {
        let mut session = session();
        session.mail("from@host").unwrap();
        session.rcpt("to@host").unwrap();
        session.logout();
        assert!(session.is_ended());
        assert_eq!(session.sender(), "from@host");
        assert_eq!(session.recipients(), ["to@host"]);
        assert!(session.rcpt("late@host").is_err());
    }

    #[tokio::test]
    async fn data_with_bad_input() {
        let mut session = session();
        session.mail("me@host").unwrap();
        session.rcpt("you@host").unwrap();
        let result = session.data(&b""[..]).await;
        assert!(matches!(
            result,
            Err(SessionError::Parse(ParseError::Empty))
        ));
        assert_eq!(session.state(), State::Failed);
        assert!(!session.is_dispatched());
    }

    #[tokio::test]
    async fn data_without_mail() {
        let mut session = session();
        let result = session.data(MESSAGE.as_bytes()).await;
        assert!(matches!(
            result,
            Err(SessionError::OutOfSequence { command: "DATA", .. })
        ));
        assert_eq!(session.state(), State::Fresh);
        assert!(session.data_raw().is_none());
    }

    #[tokio::test]
    async fn data_without_recipients() {
        let mut session = session();
        session.mail("me@host").unwrap();
        let result = session.data(MESSAGE.as_bytes()).await;
        assert!(matches!(result, Err(SessionError::OutOfSequence { .. })));
        assert!(!session.is_dispatched());
    }

    #[tokio::test]
    async fn data_posts_id() {
        let mut capture = Capture::start(StatusCode::OK).await;
        let mut session = session_for(&capture.url(), "{{ id }}");
        session.mail("freeman@mailhub.bm.net").unwrap();
        session.rcpt("vance@mailhub.bm.net").unwrap();
        session.rcpt("kleiner@mailhub.bm.net").unwrap();

        let status = session.data(&b"x"[..]).await.unwrap();
        assert_eq!(status, reqwest::StatusCode::OK);
        assert_eq!(session.state(), State::Dispatched);
        assert!(session.is_dispatched());

        let request = capture.next().await;
        assert_eq!(&request.body[..], session.id().as_bytes());
        assert_eq!(session.data_raw(), Some("x"));
        assert_eq!(session.body(), Some("x"));
        assert!(session.headers().is_some_and(|headers| headers.is_empty()));
    }

    #[tokio::test]
    async fn data_with_malformed_headers() {
        let mut capture = Capture::start(StatusCode::OK).await;
        let mut session = session_for(&capture.url(), "{{ id }}");
        session.mail("me@host").unwrap();
        session.rcpt("you@host").unwrap();

        let raw = b"no colon here\r\n\r\nbody";
        let result = session.data(&raw[..]).await;
        assert!(matches!(
            result,
            Err(SessionError::Parse(ParseError::HeaderLine(_)))
        ));
        assert_eq!(session.state(), State::Failed);
        assert!(!session.is_dispatched());
        assert!(session.headers().is_none());
        let waited = tokio::time::timeout(
            Duration::from_millis(200),
            capture.requests.recv(),
        )
        .await;
        assert!(waited.is_err(), "malformed message was posted");
    }

    #[tokio::test]
    async fn data_to_stalled_server() {
        let address = stalled_address().await;
        let mut session = session_with_timeout(
            &format!("http://{address}"),
            "{{ id }}",
            Duration::from_millis(200),
        );
        session.mail("me@host").unwrap();
        session.rcpt("you@host").unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session.data(MESSAGE.as_bytes()),
        )
        .await
        .expect("DATA was not bounded by the request timeout");
        assert!(matches!(result, Err(SessionError::Dispatch(_))));
        assert_eq!(session.state(), State::Failed);
        assert!(!session.is_dispatched());
    }

    #[tokio::test]
    async fn data_with_default_template() {
        let mut capture = Capture::start(StatusCode::OK).await;
        let mut session = session_for(&capture.url(), DEFAULT_TEMPLATE);
        session.mail("freeman@mailhub.bm.net").unwrap();
        session.rcpt("vance@mailhub.bm.net").unwrap();
        session.rcpt("kleiner@mailhub.bm.net").unwrap();
        session.data(MESSAGE.as_bytes()).await.unwrap();

        let request = capture.next().await;
        let json: serde_json::Value =
            serde_json::from_slice(&request.body).unwrap();
        assert_eq!(json["id"], session.id());
        assert_eq!(
            json["timestamp"],
            session.render_context().rfc3339().as_str()
        );
        assert_eq!(json["sender"], "freeman@mailhub.bm.net");
        assert_eq!(
            json["recipients"],
            serde_json::json!([
                "vance@mailhub.bm.net",
                "kleiner@mailhub.bm.net"
            ])
        );
        assert_eq!(json["subject"], "ON MY WAY");
        assert_eq!(json["body"], "hey guys running L8 2DAY\non the tram now");
    }

    #[tokio::test]
    async fn data_to_closed_server() {
        let address = closed_address().await;
        let mut session =
            session_for(&format!("http://{address}"), "{{ id }}");
        session.mail("me@host").unwrap();
        session.rcpt("you@host").unwrap();

        let result = session.data(MESSAGE.as_bytes()).await;
        assert!(matches!(result, Err(SessionError::Dispatch(_))));
        assert_eq!(session.state(), State::Failed);
        assert!(!session.is_dispatched());
        assert_eq!(
            session.headers().and_then(|headers| headers.get("subject")),
            Some("ON MY WAY")
        );
    }

    #[test]
    fn render_context_from_session() {
        let mut session = session();
        session.mail("me").unwrap();
        session.rcpt("you").unwrap();
        let ctx = session.render_context();
        assert_eq!(ctx.id, session.id());
        assert_eq!(ctx.timestamp, session.timestamp());
        assert_eq!(ctx.sender, "me");
        assert_eq!(ctx.recipients, ["you"]);
        assert_eq!(ctx.data, "");
        assert!(ctx.headers.is_empty());
        assert_eq!(ctx.body, "");
    }
}
