use dotenvy::dotenv;
use imagine_gateway::auth::AdminAuth;
use imagine_gateway::bot::{self, DenialCache, TelegramDelivery};
use imagine_gateway::client::{HttpRenderClient, RenderClient};
use imagine_gateway::config::{Settings, UNAUTHORIZED_CACHE_MAX_SIZE, UNAUTHORIZED_CACHE_TTL_SECS};
use imagine_gateway::delivery::Delivery;
use imagine_gateway::directory::OpenDirectory;
use imagine_gateway::gateway::{Gateway, Services};
use imagine_gateway::poller::spawn_reconciler;
use imagine_gateway::quota::QuotaLedger;
use imagine_gateway::roll::RollStore;
use imagine_gateway::storage::JsonFile;
use imagine_gateway::tracker::TaskTracker;
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    secret: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            secret: Regex::new(r#"(?i)(mj-api-secret["']?\s*[:=]\s*["']?)[^\s"',}]+"#)?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self.secret.replace_all(&output, "$1[MASKED]").to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // The caller's buffer was consumed even if the redacted length differs
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Redaction must be in place before the first log line
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);
    init_logging(patterns);

    info!("Starting imagine gateway...");

    let settings = init_settings();
    if settings.uses_default_password() {
        warn!("The administrator password is the shipped default, change it with set_password");
    }

    let roll = Arc::new(open_or_exit("roll", RollStore::open(JsonFile::new(settings.roll_path())).await));
    let ledger = Arc::new(open_or_exit(
        "quota ledger",
        QuotaLedger::open(
            JsonFile::new(settings.ledger_path()),
            settings.daily_limit,
            settings.access_window_days,
        )
        .await,
    ));
    let auth = Arc::new(open_or_exit(
        "administrator credential",
        AdminAuth::open(JsonFile::new(settings.auth_path()), &settings.admin_password).await,
    ));

    let bot = Bot::new(settings.telegram_token.clone());
    let client: Arc<dyn RenderClient> = Arc::new(HttpRenderClient::new(
        &settings.proxy_server,
        settings.proxy_api_secret.clone(),
        settings.http_timeout(),
    ));
    let delivery: Arc<dyn Delivery> = Arc::new(TelegramDelivery::new(bot.clone()));
    let tracker = Arc::new(TaskTracker::new(
        Arc::clone(&client),
        delivery,
        Arc::clone(&ledger),
        settings.task_ttl(),
    ));
    info!("Rendering service client initialized ({}).", settings.proxy_server);

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&settings),
        Services {
            roll,
            ledger,
            tracker: Arc::clone(&tracker),
            client,
            directory: Arc::new(OpenDirectory),
            auth,
        },
    ));
    let denials = init_denial_cache(&settings);

    let shutdown = CancellationToken::new();
    let reconciler = spawn_reconciler(tracker, settings.poll_interval(), shutdown.clone());

    info!("Bot is running...");

    Dispatcher::builder(bot, bot::handlers::setup_handler())
        .dependencies(dptree::deps![gateway, denials])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Dispatcher stopped, waiting for the reconciler...");
    shutdown.cancel();
    if let Err(e) = reconciler.await {
        error!("Reconciler task ended abnormally: {}", e);
    }
    info!("Shutdown complete.");
    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);

    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let filter = if debug_mode {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("imagine_gateway=info,teloxide=info,hyper=warn,h2=error,reqwest=warn")
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn open_or_exit<T, E: std::fmt::Display>(what: &str, opened: Result<T, E>) -> T {
    match opened {
        Ok(store) => {
            info!("Opened {}.", what);
            store
        }
        Err(e) => {
            error!("Failed to open {}: {}", what, e);
            std::process::exit(1);
        }
    }
}

fn init_denial_cache(settings: &Settings) -> Arc<DenialCache> {
    info!(
        "Initializing DenialCache (cooldown: {}s, ttl: {}s, max_size: {})",
        settings.denial_cooldown_secs, UNAUTHORIZED_CACHE_TTL_SECS, UNAUTHORIZED_CACHE_MAX_SIZE
    );
    Arc::new(DenialCache::new(
        settings.denial_cooldown_secs,
        UNAUTHORIZED_CACHE_TTL_SECS,
        UNAUTHORIZED_CACHE_MAX_SIZE,
    ))
}
