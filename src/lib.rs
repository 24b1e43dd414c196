//! This crate relays email received over SMTP to an HTTP endpoint.
//!
//! Every message accepted by the [`Server`] is rendered through a
//! template and sent as a single POST request to the configured url.
//! The url, the body and the values of any extra request headers are
//! [minijinja](https://docs.rs/minijinja) templates with access to the
//! envelope, the message headers and the body.
//! Delivery is attempted once: when the endpoint cannot be reached,
//! the SMTP client receives an error reply instead.
//!
//! # Examples
//!
//! ```no_run
//! # tokio_test::block_on(async {
//! use smtp_pigeon::{Config, Limits, Server, DEFAULT_TEMPLATE};
//!
//! let config = Config::new(
//!     "https://hooks.example.com/mail/{{ recipients[0]|urlencode }}",
//!     &["Authorization: Bearer {{ env('HOOK_TOKEN') }}"],
//!     DEFAULT_TEMPLATE,
//!     false,
//! )
//! .unwrap();
//!
//! let server = Server::start(
//!     "127.0.0.1:1025".parse().unwrap(),
//!     config,
//!     Limits::default(),
//! )
//! .await
//! .unwrap();
//! server.serve().await.unwrap();
//! # })
//! ```
//!
//! Templates are checked when the configuration is built,
//! so a template that cannot render is rejected up front:
//!
//! ```
//! use smtp_pigeon::Config;
//!
//! let headers: &[&str] = &[];
//! let result =
//!     Config::new("http://localhost", headers, "{{ subjct }}", false);
//! assert!(result.is_err());
//! ```

#![forbid(unsafe_code)]

mod config;
mod context;
mod dispatch;
mod message;
mod server;
mod session;
mod smtp;
mod template;

pub use config::{Config, ConfigError, HeaderSpec};
pub use context::RenderContext;
pub use dispatch::{
    DispatchError, Dispatcher, Endpoint, HeaderTemplate, DEFAULT_TIMEOUT,
};
pub use message::{HeaderMap, Message, ParseError};
pub use server::{Error, Server, DEFAULT_PORT};
pub use session::{Session, SessionError, State};
pub use smtp::{Error as SmtpError, Limits};
pub use template::{TemplateId, Templates, DEFAULT_TEMPLATE};
