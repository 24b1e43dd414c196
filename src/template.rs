use std::fmt;

use minijinja::{Environment, UndefinedBehavior};

use crate::context::RenderContext;

/// The body template used when none is configured.
///
/// Renders a JSON object with the exchange id, receipt time,
/// envelope addresses, the message body and its subject.
pub const DEFAULT_TEMPLATE: &str = concat!(
    r#"{"id":{{ id|tojson }},"#,
    r#""timestamp":{{ timestamp|tojson }},"#,
    r#""sender":{{ sender|tojson }},"#,
    r#""recipients":{{ recipients|tojson }},"#,
    r#""body":{{ body|tojson }},"#,
    r#""subject":{{ headers.get("Subject")|tojson }}}"#,
);

/// Handle to a template compiled into a [`Templates`] set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TemplateId(String);

impl TemplateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of compiled templates sharing one function table.
///
/// On top of the engine's builtin filters (`tojson`, `upper`, `trim`,
/// `replace`, `urlencode`, ...) templates can call `env(name, default)`
/// to read the process environment.
/// Referring to an undefined variable is a render error.
#[derive(Debug)]
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_function("env", env_var);
        Templates { env }
    }

    /// Compile `source` under `name`.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<TemplateId, minijinja::Error> {
        let name = name.into();
        self.env.add_template_owned(name.clone(), source.into())?;
        Ok(TemplateId(name))
    }

    pub fn render(
        &self,
        id: &TemplateId,
        ctx: &RenderContext,
    ) -> Result<String, minijinja::Error> {
        self.env.get_template(id.as_str())?.render(ctx.to_value())
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::new()
    }
}

fn env_var(name: String, default: Option<String>) -> String {
    std::env::var(&name)
        .ok()
        .or(default)
        .unwrap_or_default()
}
