use std::str::FromStr;

use reqwest::header::{HeaderName, HeaderValue};

use crate::context::RenderContext;
use crate::dispatch::{Endpoint, HeaderTemplate};
use crate::template::{TemplateId, Templates};

/// A custom request header as given on the command line,
/// in the form `Name: value-template`.
///
/// The name is a literal, the value is a template.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HeaderSpec {
    pub name: HeaderName,
    pub value: String,
}

impl FromStr for HeaderSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, value) = s
            .split_once(':')
            .map(|(name, value)| (name.trim(), value.trim()))
            .filter(|(name, value)| !name.is_empty() && !value.is_empty())
            .ok_or_else(|| ConfigError::HeaderFormat(s.to_string()))?;
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ConfigError::HeaderName {
                name: name.to_string(),
            }
        })?;
        Ok(HeaderSpec {
            name,
            value: value.to_string(),
        })
    }
}

/// The relay configuration.
///
/// Holds the compiled url, header and body templates
/// and is shared read-only by every session.
#[derive(Debug)]
pub struct Config {
    verbose: bool,
    templates: Templates,
    endpoint: Endpoint,
}

impl Config {
    /// Compile and check a configuration.
    ///
    /// Every template is rendered once against
    /// [`RenderContext::sample`], so a template that cannot render
    /// is rejected here rather than on the first message.
    pub fn new<S: AsRef<str>>(
        url: &str,
        headers: &[S],
        template: &str,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let specs = headers
            .iter()
            .map(|header| header.as_ref().parse())
            .collect::<Result<Vec<HeaderSpec>, _>>()?;
        Self::with_header_specs(url, specs, template, verbose)
    }

    /// Same as [`Config::new`] with already parsed headers.
    pub fn with_header_specs(
        url: &str,
        headers: Vec<HeaderSpec>,
        template: &str,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let mut templates = Templates::new();
        let url = compile(&mut templates, "url", url)?;
        let headers = headers
            .into_iter()
            .map(|spec| {
                let value = compile(
                    &mut templates,
                    format!("header:{}", spec.name),
                    spec.value,
                )?;
                Ok::<_, ConfigError>(HeaderTemplate {
                    name: spec.name,
                    value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let body = compile(&mut templates, "body", template)?;
        let config = Config {
            verbose,
            templates,
            endpoint: Endpoint { url, headers, body },
        };
        config.preflight()?;
        Ok(config)
    }

    fn preflight(&self) -> Result<(), ConfigError> {
        let ctx = RenderContext::sample();
        let render = |id: &TemplateId| {
            self.templates.render(id, &ctx).map_err(|source| {
                ConfigError::Preflight {
                    template: id.to_string(),
                    source,
                }
            })
        };
        render(&self.endpoint.body)?;
        let url = render(&self.endpoint.url)?;
        if let Err(error) = reqwest::Url::parse(&url) {
            return Err(ConfigError::Url {
                url,
                reason: error.to_string(),
            });
        }
        for header in &self.endpoint.headers {
            let value = render(&header.value)?;
            if HeaderValue::from_str(&value).is_err() {
                return Err(ConfigError::HeaderValue {
                    name: header.name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

fn compile(
    templates: &mut Templates,
    name: impl Into<String>,
    source: impl Into<String>,
) -> Result<TemplateId, ConfigError> {
    let name = name.into();
    templates
        .add(name.clone(), source)
        .map_err(|source| ConfigError::Compile {
            template: name,
            source,
        })
}

/// An error in the relay configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("headers must be in the format `Name: value`, got {0:?}")]
    HeaderFormat(String),
    #[error("invalid header name {name:?}")]
    HeaderName { name: String },
    #[error("could not parse {template} template")]
    Compile {
        template: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("could not execute {template} template")]
    Preflight {
        template: String,
        #[source]
        source: minijinja::Error,
    },
    #[error("url template renders an invalid url {url:?}: {reason}")]
    Url { url: String, reason: String },
    #[error("header {name} renders an invalid value {value:?}")]
    HeaderValue { name: String, value: String },
}
