use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes synthetic container telemetry", long_about = None)]
struct Args {
    /// MQTT Broker Host
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    host: String,

    /// MQTT Broker Port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of simulated containers
    #[arg(long, default_value_t = 3)]
    containers: u32,

    /// Messages per second across all containers
    #[arg(long, default_value_t = 1)]
    rate: u64,

    /// Duration in seconds (0 for infinite)
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Food profile declared by new containers
    #[arg(long, default_value = "bananas")]
    food_type: String,

    /// Probability that any single reading is left out of a message
    #[arg(long, default_value_t = 0.1)]
    drop_rate: f64,
}

#[derive(Serialize)]
struct Gps {
    lat: f64,
    lon: f64,
    fix: u8,
    satellites: u8,
}

#[derive(Serialize)]
struct ContainerTelemetry {
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mq4_ppm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gps: Option<Gps>,
    selected_food_type: String,
}

fn maybe<T>(rng: &mut impl Rng, drop_rate: f64, value: T) -> Option<T> {
    if rng.gen_bool(drop_rate.clamp(0.0, 1.0)) {
        None
    } else {
        Some(value)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.containers == 0 || args.rate == 0 {
        anyhow::bail!("--containers and --rate must be at least 1");
    }
    println!("Starting device simulator with config: {:?}", args);

    let client_id = format!("device_simulator_{}", uuid::Uuid::new_v4());
    let mut mqttoptions = MqttOptions::new(client_id, &args.host, args.port);
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    tokio::spawn(async move {
        while eventloop.poll().await.is_ok() {
            // Just drain the event loop
        }
    });

    let start_time = std::time::Instant::now();
    let mut interval = time::interval(Duration::from_micros(1_000_000 / args.rate));
    let mut total_sent: u64 = 0;

    loop {
        interval.tick().await;

        if args.duration > 0 && start_time.elapsed().as_secs() >= args.duration {
            println!("Configured duration {}s elapsed. Stopping.", args.duration);
            break;
        }

        // Round-robin over containers
        let index = total_sent % u64::from(args.containers);
        let device_id = format!("container_{:03}", index + 1);

        let mut rng = rand::thread_rng();
        let timestamp = ::time::OffsetDateTime::now_utc()
            .format(&::time::format_description::well_known::Rfc3339)?;
        let gps = Gps {
            lat: 52.37 + rng.gen_range(-0.05..0.05),
            lon: 4.89 + rng.gen_range(-0.05..0.05),
            fix: 1,
            satellites: rng.gen_range(4..12),
        };
        let temperature: f64 = rng.gen_range(2.0..28.0);
        let humidity: f64 = rng.gen_range(35.0..99.0);
        let gas: f64 = rng.gen_range(100.0..900.0);
        let payload = ContainerTelemetry {
            timestamp,
            temperature_c: maybe(&mut rng, args.drop_rate, temperature),
            humidity_pct: maybe(&mut rng, args.drop_rate, humidity),
            mq4_ppm: maybe(&mut rng, args.drop_rate, gas),
            gps: maybe(&mut rng, args.drop_rate, gps),
            selected_food_type: args.food_type.clone(),
        };

        let topic = format!("containers/{}/telemetry", device_id);
        let payload_json = serde_json::to_vec(&payload)?;

        if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload_json).await {
            eprintln!("Failed to publish: {:?}", e);
        }

        total_sent += 1;
        if total_sent % args.rate == 0 {
            println!("Sent {} messages...", total_sent);
        }
    }

    println!("Simulation complete. Total messages sent: {}", total_sent);
    Ok(())
}
