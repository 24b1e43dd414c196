use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use smtp_pigeon::{Config, Limits, Server, DEFAULT_PORT, DEFAULT_TEMPLATE};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Relay inbound SMTP mail to an HTTP endpoint.
///
/// The url, header values and body are templates and can access
/// `id`, `timestamp`, `timestamp_unix`, `sender`, `recipients`,
/// `data` (the raw message), `body` and `headers`
/// (e.g. `headers.get("Subject")`), and call `env("NAME")`.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// URL to make the HTTP POST to
    #[arg(long, env = "PIGEON_URL")]
    url: String,

    /// Header to attach to the POST, in the form "Name: value";
    /// may be given multiple times
    #[arg(long = "header", env = "PIGEON_HEADERS", value_delimiter = '\n')]
    headers: Vec<String>,

    /// Template used to render the POST body. Does not have to be JSON
    /// if you set the appropriate Content-Type header
    #[arg(long, env = "PIGEON_TEMPLATE", conflicts_with = "template_file")]
    template: Option<String>,

    /// Read the body template from a file
    #[arg(long, env = "PIGEON_TEMPLATE_FILE")]
    template_file: Option<PathBuf>,

    /// Mail domain to reply to EHLO with
    #[arg(long, env = "PIGEON_DOMAIN", default_value = "localhost")]
    domain: String,

    /// Address to bind to
    #[arg(long, env = "PIGEON_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PIGEON_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds to wait on a client read or write, and on the endpoint
    #[arg(long, env = "PIGEON_TIMEOUT", default_value_t = 10)]
    timeout: u64,

    /// Largest message accepted, in bytes
    #[arg(
        long,
        env = "PIGEON_MAX_MESSAGE_BYTES",
        default_value_t = 1024 * 1024
    )]
    max_message_bytes: usize,

    /// Most recipients accepted for one message
    #[arg(long, env = "PIGEON_MAX_RECIPIENTS", default_value_t = 50)]
    max_recipients: usize,

    /// Enable verbose logging
    #[arg(long, env = "PIGEON_VERBOSE")]
    verbose: bool,

    /// Prefix logs with date and time
    #[arg(long, env = "PIGEON_STANDALONE_LOGGING")]
    standalone_logging: bool,
}

impl Args {
    fn template(&self) -> anyhow::Result<String> {
        match (&self.template, &self.template_file) {
            (Some(template), _) => Ok(template.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display())),
            (None, None) => Ok(DEFAULT_TEMPLATE.to_string()),
        }
    }

    fn limits(&self) -> Limits {
        let timeout = Duration::from_secs(self.timeout);
        Limits {
            domain: self.domain.clone(),
            read_timeout: timeout,
            write_timeout: timeout,
            max_message_bytes: self.max_message_bytes,
            max_recipients: self.max_recipients,
        }
    }
}

fn init_logging(args: &Args) {
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if args.standalone_logging {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let template = args.template()?;
    let config = Config::new(&args.url, &args.headers, &template, args.verbose)
        .context("invalid configuration")?;

    let address = SocketAddr::new(args.host, args.port);
    let server = Server::start(address, config, args.limits())
        .await
        .with_context(|| format!("could not listen on {address}"))?;

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
