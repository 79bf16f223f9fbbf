use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use observer::archive::{DocumentIndexer, HttpDocumentIndexer};
use observer::config::MonitorConfig;
use observer::db::enums::{IntervalUnit, ServiceKind, ServiceStatus};
use observer::db::memory::InMemoryRepository;
use observer::db::models::{IntervalSpec, ServiceDescriptor};
use observer::db::postgres::PgRepository;
use observer::db::MonitorRepository;
use observer::monitoring::probes::Prober;
use observer::monitoring::{MonitorContext, Supervisor};
use observer::notifications::publisher::BroadcastPublisher;
use observer::notifications::senders::mail_relay::MailRelaySender;
use observer::notifications::senders::twilio::TwilioSmsSender;
use observer::notifications::senders::ChannelSenders;
use observer::notifications::service::AlertService;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Monitor a few built-in public targets from memory instead of Postgres
    #[arg(long)]
    demo: bool,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "monitor.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn demo_services() -> Vec<ServiceDescriptor> {
    let targets = [
        (1, "example.com", "https://example.com", ServiceKind::Https, 1, IntervalUnit::Minutes),
        (2, "example.com", "example.com", ServiceKind::TlsCertificate, 1, IntervalUnit::Hours),
        (3, "httpbin", "http://httpbin.org/status/200", ServiceKind::Http, 30, IntervalUnit::Seconds),
    ];
    targets
        .into_iter()
        .map(|(id, host, url, kind, number, unit)| ServiceDescriptor {
            id,
            host_id: id,
            host_name: host.to_string(),
            host_url: url.to_string(),
            service_type_id: kind.id(),
            service_name: match kind {
                ServiceKind::Http => "HTTP",
                ServiceKind::Https => "HTTPS",
                ServiceKind::TlsCertificate => "SSL Certificate",
            }
            .to_string(),
            icon: String::new(),
            active: true,
            schedule: IntervalSpec::new(number, unit),
            status: ServiceStatus::Pending,
            last_message: String::new(),
            last_check: None,
        })
        .collect()
}

fn alert_service(config: &MonitorConfig) -> AlertService {
    let client = reqwest::Client::new();
    let email = config
        .mail_relay_url
        .as_deref()
        .map(|url| MailRelaySender::new(client.clone(), url, config.mail_from.clone()));
    let sms = match (&config.twilio_sid, &config.twilio_auth_token, &config.twilio_phone_number) {
        (Some(sid), Some(token), Some(from)) => {
            Some(TwilioSmsSender::new(client.clone(), sid.clone(), token.clone(), from.clone()))
        }
        _ => None,
    };
    if config.email_alerts_enabled && email.is_none() {
        warn!("Email alerts are enabled but no mail_relay_url is configured.");
    }
    if config.sms_alerts_enabled && sms.is_none() {
        warn!("SMS alerts are enabled but the Twilio account is not fully configured.");
    }
    AlertService::new(
        Arc::new(ChannelSenders::new(email, sms)),
        config.alert_email_to.clone(),
        config.alert_sms_to.clone(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = MonitorConfig::load(args.config.as_deref())?;
    init_logging(&config.log_dir);
    info!(version = env!("CARGO_PKG_VERSION"), demo = args.demo, "Starting monitor.");

    let repository: Arc<dyn MonitorRepository> = if args.demo {
        Arc::new(InMemoryRepository::with_services(demo_services()))
    } else {
        let database_url = config
            .database_url
            .as_deref()
            .ok_or("DATABASE_URL must be set unless running with --demo")?;
        match PgRepository::connect(database_url).await {
            Ok(repo) => {
                info!("Successfully connected to the database.");
                Arc::new(repo)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to the database.");
                return Err(e.into());
            }
        }
    };

    let indexer: Option<Arc<dyn DocumentIndexer>> = config.document_store_url.as_deref().map(|url| {
        Arc::new(HttpDocumentIndexer::new(reqwest::Client::new(), url)) as Arc<dyn DocumentIndexer>
    });
    let prober = Prober::new(config.probe_timeout())?.with_phase_tracing(indexer.is_some());

    let publisher = BroadcastPublisher::new(256);
    let mut events_rx = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => info!(channel = %event.channel, event = %event.event, payload = ?event.payload, "Dashboard event."),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind.");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let context = MonitorContext::new(
        repository,
        Arc::new(prober),
        Arc::new(publisher),
        alert_service(&config),
        config.display_offset()?,
    )
    .with_alert_policy(config.alert_policy())
    .with_indexer(indexer)
    .with_monitoring_live(config.monitoring_live);
    let supervisor = Supervisor::new(context);

    if config.monitoring_live {
        let scheduled = supervisor.start().await?;
        info!(services = scheduled, "Monitoring is live.");
    } else {
        info!("Monitoring is switched off; set MONITORING_LIVE=true to schedule checks.");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    if supervisor.is_live() {
        if let Err(e) = supervisor.stop().await {
            warn!(error = %e, "Monitoring did not stop cleanly.");
        }
    }
    Ok(())
}
