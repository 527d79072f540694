use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use papaya_telemetry::OverflowPolicy;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

fn parse_interval(s: &str) -> Result<Duration, String> {
    let interval = parse_duration(s).map_err(|e| e.to_string())?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_owned());
    }
    Ok(interval)
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// Device configuration file
    #[arg(env = "PAPAYA_CONFIG", long = "config", value_name = "path")]
    pub config: PathBuf,

    /// Management API request timeout in milliseconds
    #[arg(
        env = "PAPAYA_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub request_timeout: Option<Duration>,

    /// Geolocation lookup timeout in milliseconds
    #[arg(
        env = "PAPAYA_GEOLOCATION_TIMEOUT_MS",
        long = "geolocation-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub geolocation_timeout: Option<Duration>,

    /// How long a validated session token is trusted, in milliseconds
    #[arg(
        env = "PAPAYA_TOKEN_VALIDITY_MS",
        long = "token-validity-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub token_validity: Option<Duration>,

    /// How many times to try provisioning when the platform is unreachable
    #[arg(
        env = "PAPAYA_PROVISION_ATTEMPTS",
        long = "provision-attempts",
        value_name = "int",
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub provision_attempts: u32,

    /// MQTT broker port, the host is taken from the platform URL
    #[arg(
        env = "PAPAYA_MQTT_PORT",
        long = "mqtt-port",
        value_name = "port",
        default_value_t = 1883
    )]
    pub mqtt_port: u16,

    /// Maximum number of readings waiting to be published
    #[arg(
        env = "PAPAYA_QUEUE_CAPACITY",
        long = "queue-capacity",
        value_name = "int",
        default_value_t = 1024,
        conflicts_with = "unbounded_queue"
    )]
    pub queue_capacity: usize,

    /// Never drop readings because the queue is full
    #[arg(env = "PAPAYA_UNBOUNDED_QUEUE", long = "unbounded-queue")]
    pub unbounded_queue: bool,

    /// What to drop when the queue is full, 'drop-newest' or 'drop-oldest'
    #[arg(
        env = "PAPAYA_OVERFLOW_POLICY",
        long = "overflow-policy",
        value_name = "policy",
        default_value = "drop-newest"
    )]
    pub overflow_policy: OverflowPolicy,

    /// Interval between delivery metrics reports in milliseconds
    #[arg(
        env = "PAPAYA_METRICS_INTERVAL_MS",
        long = "metrics-interval-ms",
        value_name = "ms",
        default_value = "60000",
        value_parser = parse_interval
    )]
    pub metrics_interval: Duration,

    /// Read readings from standard input, one JSON object per line
    ///
    /// The process shuts down once standard input is closed.
    #[arg(env = "PAPAYA_STDIN", long = "stdin")]
    pub stdin: bool,
}

impl Cli {
    pub fn queue_capacity(&self) -> Option<usize> {
        if self.unbounded_queue {
            None
        } else {
            Some(self.queue_capacity)
        }
    }
}

pub fn parse() -> Cli {
    Parser::parse()
}
