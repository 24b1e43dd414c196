use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};
use tracing::{debug, event, Level};

use crate::session::{Session, SessionError, State};

const MAX_LINE: usize = 4096;

/// An error during an SMTP exchange.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Limits applied to every connection.
#[derive(Clone, Debug)]
pub struct Limits {
    /// The name announced in the greeting and `EHLO` reply.
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Messages larger than this are refused without being posted.
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            domain: "localhost".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            max_recipients: 50,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Hello { extended: bool, domain: String },
    Auth { mechanism: String, initial: Option<String> },
    Mail { from: String },
    Rcpt { to: String },
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    Unknown(String),
    Syntax(&'static str),
}

impl Command {
    pub(crate) fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
        let args = args.trim();
        match verb.to_ascii_uppercase().as_str() {
            "EHLO" | "HELO" => Command::Hello {
                extended: verb.eq_ignore_ascii_case("EHLO"),
                domain: args.to_string(),
            },
            "AUTH" => {
                let mut parts = args.split_whitespace();
                match parts.next() {
                    Some(mechanism) => Command::Auth {
                        mechanism: mechanism.to_ascii_uppercase(),
                        initial: parts.next().map(str::to_string),
                    },
                    None => Command::Syntax("AUTH requires a mechanism"),
                }
            }
            "MAIL" => match path_argument(args, "FROM:") {
                Some(from) => Command::Mail { from },
                None => Command::Syntax("expected MAIL FROM:<address>"),
            },
            "RCPT" => match path_argument(args, "TO:") {
                Some(to) if !to.is_empty() => Command::Rcpt { to },
                _ => Command::Syntax("expected RCPT TO:<address>"),
            },
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "VRFY" => Command::Vrfy,
            "QUIT" => Command::Quit,
            _ => Command::Unknown(verb.to_string()),
        }
    }
}

enum Line {
    Complete(String),
    TooLong,
}

/// Extract the address from `FROM:<address> [parameters]`.
///
/// An address without angle brackets is accepted as well.
fn path_argument(args: &str, keyword: &str) -> Option<String> {
    let prefix = args.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim_start();
    if let Some(rest) = rest.strip_prefix('<') {
        let (address, _parameters) = rest.split_once('>')?;
        Some(address.to_string())
    } else {
        rest.split_whitespace().next().map(str::to_string)
    }
}

/// Drives one connection: reads commands,
/// calls into the session and writes the replies.
pub(crate) struct Connection<S> {
    stream: BufReader<S>,
    limits: Limits,
    session: Session,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub(crate) fn new(stream: S, limits: Limits, session: Session) -> Self {
        Connection {
            stream: BufReader::new(stream),
            limits,
            session,
        }
    }

    /// Serve the connection until the client quits or goes away.
    ///
    /// The session is logged out in every case.
    pub(crate) async fn run(mut self) -> Result<Session, Error> {
        let result = self.serve().await;
        self.session.logout();
        result.map(|()| self.session)
    }

    async fn serve(&mut self) -> Result<(), Error> {
        let greeting = format!(
            "220 {} ESMTP {}",
            self.limits.domain,
            env!("CARGO_PKG_NAME")
        );
        self.write(&greeting).await?;
        loop {
            let command = match self.read_line().await? {
                Some(Line::Complete(line)) => Command::parse(&line),
                Some(Line::TooLong) => {
                    self.write("500 5.5.6 Line too long").await?;
                    continue;
                }
                None => return Ok(()),
            };
            match command {
                Command::Hello { extended, domain } => {
                    debug!(%domain, "hello");
                    self.hello(extended).await?;
                }
                Command::Auth { mechanism, initial } => {
                    self.auth(&mechanism, initial).await?;
                }
                Command::Mail { from } => match self.session.mail(&from) {
                    Ok(()) => self.write("250 2.1.0 Ok").await?,
                    Err(error) => self.refuse(&error).await?,
                },
                Command::Rcpt { to } => {
                    if self.session.recipients().len()
                        >= self.limits.max_recipients
                    {
                        self.write("452 4.5.3 Too many recipients").await?;
                        continue;
                    }
                    match self.session.rcpt(&to) {
                        Ok(()) => self.write("250 2.1.5 Ok").await?,
                        Err(error) => self.refuse(&error).await?,
                    }
                }
                Command::Data => {
                    let ready = self.session.state() == State::ReceivingEnvelope
                        && !self.session.recipients().is_empty();
                    if !ready {
                        self.write("503 5.5.1 Need MAIL and RCPT first")
                            .await?;
                        continue;
                    }
                    self.data().await?;
                }
                Command::Rset => {
                    self.session.reset();
                    self.write("250 2.0.0 Ok").await?;
                }
                Command::Noop => self.write("250 2.0.0 Ok").await?,
                Command::Vrfy => {
                    self.write("252 2.5.0 Cannot verify user").await?
                }
                Command::Quit => {
                    self.write("221 2.0.0 Bye").await?;
                    return Ok(());
                }
                Command::Unknown(verb) => {
                    debug!(%verb, "unknown command");
                    self.write("500 5.5.2 Unrecognized command").await?;
                }
                Command::Syntax(reason) => {
                    self.write(&format!("501 5.5.4 {reason}")).await?;
                }
            }
        }
    }

    async fn hello(&mut self, extended: bool) -> Result<(), Error> {
        let domain = self.limits.domain.clone();
        if extended {
            self.write(&format!("250-{domain}")).await?;
            self.write("250-AUTH PLAIN LOGIN").await?;
            self.write("250-8BITMIME").await?;
            let size = self.limits.max_message_bytes;
            self.write(&format!("250 SIZE {size}")).await
        } else {
            self.write(&format!("250 {domain}")).await
        }
    }

    /// Every client is accepted, whatever it authenticates with.
    async fn auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<(), Error> {
        let username = match mechanism {
            "PLAIN" => {
                let response = match initial {
                    Some(response) => response,
                    None => {
                        self.write("334 ").await?;
                        self.read_required().await?
                    }
                };
                decode(&response)
                    .split(|&byte| byte == 0)
                    .nth(1)
                    .map(|name| String::from_utf8_lossy(name).into_owned())
            }
            "LOGIN" => {
                let username = match initial {
                    Some(username) => username,
                    None => {
                        self.write("334 VXNlcm5hbWU6").await?;
                        self.read_required().await?
                    }
                };
                self.write("334 UGFzc3dvcmQ6").await?;
                self.read_required().await?;
                Some(String::from_utf8_lossy(&decode(&username)).into_owned())
            }
            _ => {
                return self
                    .write("504 5.5.4 Unrecognized authentication type")
                    .await;
            }
        };
        debug!(mechanism, ?username, "accepting authentication");
        self.write("235 2.7.0 Authentication successful").await
    }

    async fn data(&mut self) -> Result<(), Error> {
        self.write("354 End data with <CR><LF>.<CR><LF>").await?;
        let max = self.limits.max_message_bytes;
        let mut message = Vec::new();
        let mut oversized = false;
        loop {
            let mut line = Vec::new();
            // room for a stuffed dot and the line ending
            let limit = max.saturating_add(3);
            let (len, overflow) = self.read_raw(&mut line, limit).await?;
            if len == 0 {
                let eof = std::io::ErrorKind::UnexpectedEof;
                return Err(Error::Io(eof.into()));
            }
            if line == b".\r\n" || line == b".\n" {
                break;
            }
            let line = line.strip_prefix(b".").unwrap_or(&line);
            if overflow || message.len() + line.len() > max {
                oversized = true;
            }
            if !oversized {
                message.extend_from_slice(line);
            }
        }

        if oversized {
            self.session.reset();
            return self.write("552 5.3.4 Message too big").await;
        }
        let reply = match self.session.data(&message[..]).await {
            Ok(_) => "250 2.0.0 Ok: queued".to_string(),
            Err(error) => reply_for(&error),
        };
        self.session.reset();
        self.write(&reply).await
    }

    async fn refuse(&mut self, error: &SessionError) -> Result<(), Error> {
        self.write(&reply_for(error)).await
    }

    /// Read one whole line into `buffer`, keeping at most `limit` bytes.
    ///
    /// Returns the number of bytes read from the client
    /// and whether part of the line was dropped.
    async fn read_raw(
        &mut self,
        buffer: &mut Vec<u8>,
        limit: usize,
    ) -> Result<(usize, bool), Error> {
        let timeout = self.limits.read_timeout;
        let mut total = 0;
        let mut overflow = false;
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            let mut limited = (&mut self.stream).take(MAX_LINE as u64);
            let read = limited.read_until(b'\n', &mut chunk);
            let len = tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| Error::Timeout(timeout))??;
            total += len;
            let room = limit.saturating_sub(buffer.len());
            if chunk.len() > room {
                overflow = true;
            }
            buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if len == 0 || chunk.ends_with(b"\n") {
                break;
            }
        }
        event!(Level::TRACE, recv = %String::from_utf8_lossy(buffer));
        Ok((total, overflow))
    }

    /// Read a command line, `None` once the client has gone.
    async fn read_line(&mut self) -> Result<Option<Line>, Error> {
        let mut buffer = Vec::new();
        let (len, overflow) = self.read_raw(&mut buffer, MAX_LINE).await?;
        if len == 0 {
            return Ok(None);
        }
        if overflow {
            return Ok(Some(Line::TooLong));
        }
        let line = String::from_utf8_lossy(&buffer).trim_end().to_string();
        Ok(Some(Line::Complete(line)))
    }

    async fn read_required(&mut self) -> Result<String, Error> {
        match self.read_line().await? {
            Some(Line::Complete(line)) => Ok(line),
            Some(Line::TooLong) => Ok(String::new()),
            None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
        }
    }

    async fn write(&mut self, data: &str) -> Result<(), Error> {
        event!(Level::TRACE, send = data);
        let timeout = self.limits.write_timeout;
        let stream = self.stream.get_mut();
        let write = async {
            stream.write_all(data.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        Ok(())
    }
}

fn decode(value: &str) -> Vec<u8> {
    use base64ct::Encoding;
    base64ct::Base64::decode_vec(value.trim()).unwrap_or_default()
}

/// The reply sent to the client when the session refuses a command.
fn reply_for(error: &SessionError) -> String {
    match error {
        SessionError::OutOfSequence { .. } => {
            "503 5.5.1 Bad sequence of commands".to_string()
        }
        SessionError::Parse(_) => "550 5.6.0 Malformed message".to_string(),
        SessionError::Io(_) => {
            "451 4.3.0 Could not read message".to_string()
        }
        SessionError::Dispatch(_) => {
            "554 5.0.0 Transaction failed: could not deliver to endpoint"
                .to_string()
        }
    }
}
