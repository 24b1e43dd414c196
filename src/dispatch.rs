use std::time::Duration;

use reqwest::header::{
    HeaderMap as RequestHeaders, HeaderName, HeaderValue, CONTENT_TYPE,
};
use reqwest::{StatusCode, Url};
use tracing::{debug, info, warn};

use crate::context::RenderContext;
use crate::template::{TemplateId, Templates};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to deliver a message:
/// the url, header value and body templates.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub url: TemplateId,
    pub headers: Vec<HeaderTemplate>,
    pub body: TemplateId,
}

/// A request header with a literal name and a templated value.
#[derive(Clone, Debug)]
pub struct HeaderTemplate {
    pub name: HeaderName,
    pub value: TemplateId,
}

/// An error while delivering a message.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("could not execute {template} template")]
    Render {
        template: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("rendered url {url:?} is not valid: {reason}")]
    Url { url: String, reason: String },
    #[error("rendered value of header {name} is not valid")]
    HeaderValue {
        name: HeaderName,
        #[source]
        source: reqwest::header::InvalidHeaderValue,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Sends rendered messages to their endpoint.
///
/// Cloning is cheap, clones share one connection pool.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    client: reqwest::Client,
    verbose: bool,
}

impl Dispatcher {
    /// Create a dispatcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;
        Ok(Dispatcher {
            client,
            verbose: false,
        })
    }

    /// Log the rendered request target at `info` instead of `debug`.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Render the endpoint against `ctx` and POST the body.
    ///
    /// Nothing is sent unless every template renders.
    /// Any status the server answers with counts as delivered,
    /// only transport failures are errors.
    pub async fn post(
        &self,
        templates: &Templates,
        endpoint: &Endpoint,
        ctx: &RenderContext,
    ) -> Result<StatusCode, DispatchError> {
        let render = |id: &TemplateId| {
            templates
                .render(id, ctx)
                .map_err(|source| DispatchError::Render {
                    template: id.to_string(),
                    source,
                })
        };

        let body = render(&endpoint.body)?;
        let url = render(&endpoint.url)?;
        let url = Url::parse(&url).map_err(|error| DispatchError::Url {
            reason: error.to_string(),
            url,
        })?;

        let mut headers = RequestHeaders::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for header in &endpoint.headers {
            let value = render(&header.value)?;
            let value = HeaderValue::from_str(&value).map_err(|source| {
                DispatchError::HeaderValue {
                    name: header.name.clone(),
                    source,
                }
            })?;
            headers.insert(header.name.clone(), value);
        }

        if self.verbose {
            let names: Vec<_> = headers.keys().collect();
            info!(%url, headers = ?names, bytes = body.len(), "POST");
        } else {
            debug!(%url, bytes = body.len(), "POST");
        }

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            warn!(%status, "endpoint answered with a non-success status");
        }
        Ok(status)
    }
}
