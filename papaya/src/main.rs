use std::error::Error;
use std::future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument, trace, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use papaya_remote as remote;
use papaya_telemetry as telemetry;
use papaya_util as util;

use crate::cli::Cli;
use crate::remote::{
    CredentialStore, DeviceConfig, PlatformClient, Provisioned, Provisioner, ProvisioningError,
};
use crate::telemetry::{
    MqttConfig, MqttTransport, Producer, Publisher, Reading, TELEMETRY_TOPIC, TelemetryQueue,
};
use crate::util::dirs::config_dir;
use crate::util::store::Store;

/// Upper bound for the wait between provisioning attempts
const MAX_PROVISION_BACKOFF: Duration = Duration::from_secs(60);

/// How long queued readings may take to go out once shutdown starts
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the broker before the publisher starts anyway
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("debug,rumqttc=warn,hyper=error,hyper_util=error,reqwest=info")
            }),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing();

    let cli = cli::parse();
    let config = load_config(&cli).await?;

    // Credentials survive restarts so a valid session is reused
    let credentials = CredentialStore::open(Store::new(config_dir())).await?;

    let queue = TelemetryQueue::new(cli.queue_capacity(), cli.overflow_policy);

    let platform = PlatformClient::new(config.platform.url.clone(), config.request.timeout);
    let provisioner = Provisioner::new(platform, config.clone(), credentials);
    let provisioned =
        provision_with_retry(&provisioner, &queue.producer(), cli.provision_attempts).await?;

    let host = config
        .platform
        .url
        .host()
        .ok_or("platform url has no host")?
        .to_owned();
    let mqtt = MqttConfig::new(host, cli.mqtt_port, config.assets.device_name.clone());

    start_supervisor(&cli, mqtt, provisioned, queue).await;

    Ok(())
}

/// Read the device config and apply the CLI overrides
async fn load_config(cli: &Cli) -> Result<DeviceConfig, Box<dyn Error>> {
    let mut config = DeviceConfig::load(&cli.config).await?;

    if let Some(timeout) = cli.request_timeout {
        config.request.timeout = timeout;
    }
    if let Some(timeout) = cli.geolocation_timeout {
        config.request.geolocation_timeout = timeout;
    }
    if let Some(validity) = cli.token_validity {
        config.request.token_validity = validity;
    }

    trace!(config = ?config, "using config:");
    Ok(config)
}

/// Run provisioning until it succeeds, fails for good, or runs out of
/// attempts.
///
/// Only failures that may clear on their own (unreachable platform, server
/// errors) are retried.
#[instrument(name = "papaya", skip_all, err)]
async fn provision_with_retry(
    provisioner: &Provisioner<PlatformClient>,
    producer: &Producer,
    attempts: u32,
) -> Result<Provisioned, ProvisioningError> {
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match provisioner.run(producer).await {
            Ok(provisioned) => {
                info!(
                    device = %provisioned.hierarchy.device.name,
                    state = %provisioned.hierarchy.state.name,
                    country = %provisioned.hierarchy.country.name,
                    "device provisioned"
                );
                return Ok(provisioned);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!("{e}, retrying in {backoff:?} ({attempt}/{attempts})");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_PROVISION_BACKOFF);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[instrument(name = "papaya", skip_all)]
async fn start_supervisor(
    cli: &Cli,
    mqtt: MqttConfig,
    provisioned: Provisioned,
    queue: TelemetryQueue,
) {
    let transport = MqttTransport::connect(&mqtt, &provisioned.access_token);

    // The handshake is already queued, hold it until the broker answers
    if !transport.wait_connected(CONNECT_TIMEOUT).await {
        warn!(
            "broker did not accept the connection within {CONNECT_TIMEOUT:?}, readings are dropped until it does"
        );
    }

    let worker = Publisher::new(queue.clone(), transport).run(TELEMETRY_TOPIC);
    tokio::pin!(worker);

    let producer = queue.producer();
    let read_stdin = cli.stdin;

    // Start main loop and stop on the first branch that returns
    let transport = tokio::select! {
        // The worker only returns once the queue is closed
        transport = &mut worker => Some(transport),

        // Forward readings from standard input
        _ = async move {
            if !read_stdin {
                future::pending::<()>().await;
            }
            match forward_readings(producer).await {
                Ok(()) => info!("input closed"),
                Err(e) => warn!("failed to read input: {e}"),
            }
        } => None,

        // Report delivery metrics
        _ = report_metrics(queue.clone(), cli.metrics_interval) => None,

        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            None
        }
    };

    // Stop accepting readings and give the worker a chance to drain
    queue.close();
    let transport = match transport {
        Some(transport) => Some(transport),
        None => tokio::time::timeout(DRAIN_TIMEOUT, worker).await.ok(),
    };

    match transport {
        Some(transport) => transport.disconnect().await,
        None => warn!("{} reading(s) left unpublished", queue.len()),
    }

    let metrics = queue.metrics();
    info!(
        enqueued = metrics.enqueued,
        published = metrics.publish_count,
        failed = metrics.failed_count,
        dropped = metrics.dropped_count,
        "telemetry stopped"
    );
}

/// Queue every line of standard input as a reading.
///
/// Lines are JSON objects, either `{"ts": .., "values": {..}}` or a flat
/// map of metric keys to values.
#[instrument(name = "input", skip_all)]
async fn forward_readings(producer: Producer) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Reading>(line) {
            Ok(reading) => {
                if !producer.enqueue_packet(reading.into()) {
                    debug!("queue full, reading dropped");
                }
            }
            Err(e) => warn!("ignoring malformed reading: {e}"),
        }
    }
    Ok(())
}

/// Periodically log the delivery counters so silent drops are visible
async fn report_metrics(queue: TelemetryQueue, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let metrics = queue.metrics();
        info!(
            enqueued = metrics.enqueued,
            published = metrics.publish_count,
            failed = metrics.failed_count,
            dropped = metrics.dropped_count,
            pending = metrics.pending,
            "telemetry"
        );
    }
}
