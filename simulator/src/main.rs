mod telemetry;

use chrono::Utc;
use clap::Parser;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::{Duration, Instant};
use telemetry::{generate_payload, Measurement};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Publishes synthetic node telemetry to Kafka
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    /// Kafka bootstrap servers
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", default_value = "localhost:9092")]
    brokers: String,

    /// Topic to publish to
    #[arg(long, env = "TOPIC", default_value = "cray-telemetry-temperature")]
    topic: String,

    /// Target messages per second
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,

    /// Number of simulated node controllers
    #[arg(long, env = "NODES", default_value_t = 100)]
    nodes: usize,

    /// Sensor readings per message
    #[arg(long, env = "SENSORS", default_value_t = 8)]
    sensors: usize,

    /// Stop after this many seconds (runs until Ctrl-C when unset)
    #[arg(long, env = "DURATION_SECS")]
    duration_secs: Option<u64>,
}

const BURST_SIZE: u64 = 200;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.rate == 0 || args.nodes == 0 {
        error!("Rate and node count must be positive");
        std::process::exit(2);
    }

    info!("Starting Telemetry Simulator");
    info!(
        "Brokers: {}, Topic: {}, Rate: {} msg/s, Nodes: {}",
        args.brokers, args.topic, args.rate, args.nodes
    );

    let producer: FutureProducer = match ClientConfig::new()
        .set("bootstrap.servers", &args.brokers)
        .set("client.id", format!("simulator-{}", uuid::Uuid::new_v4()))
        .set("linger.ms", "5")
        .set("message.timeout.ms", "5000")
        .create()
    {
        Ok(producer) => producer,
        Err(e) => {
            error!("Failed to create Kafka producer: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = publish(&producer, &args) => {}
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
    }

    if let Err(e) = producer.flush(Timeout::After(Duration::from_secs(10))) {
        warn!("Flush incomplete: {}", e);
    }
    info!("Simulator stopped");
}

async fn publish(producer: &FutureProducer, args: &Args) {
    let burst_size = BURST_SIZE.min(args.rate);
    let burst_interval = Duration::from_millis((burst_size * 1000) / args.rate);
    info!(
        "Publishing in bursts of {} messages every {:?}",
        burst_size, burst_interval
    );

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut rng = rand::thread_rng();
    let mut counter = 0u64;
    let mut failures = 0u64;

    while deadline.map_or(true, |deadline| Instant::now() < deadline) {
        let burst_start = Instant::now();

        for _ in 0..burst_size {
            let node = (counter % args.nodes as u64) as usize;
            let measurement = Measurement::ALL[(counter / args.nodes as u64) as usize % Measurement::ALL.len()];
            let telemetry = generate_payload(&mut rng, node, measurement, args.sensors, Utc::now());

            let payload = match serde_json::to_vec(&telemetry) {
                Ok(p) => p,
                Err(e) => {
                    error!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };

            let record = FutureRecord::to(&args.topic)
                .key(&telemetry.context)
                .payload(&payload);
            match producer.send_result(record) {
                Ok(_) => counter += 1,
                Err((e, _)) => {
                    failures += 1;
                    warn!("Failed to publish: {}", e);
                }
            }
        }

        if counter % 10_000 < burst_size {
            info!("Published {} messages ({} failed)", counter, failures);
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }

    info!("Published {} messages ({} failed)", counter, failures);
}
