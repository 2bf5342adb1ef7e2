//! Simulated power-meter node: publishes NotifyStatus-style telemetry for
//! a bank of fake laundry machines so the hub can be developed without a
//! meter on the bench.

mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Map, Value};
use std::{env, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sim::{estimate_current, Appliance, CycleSim};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(15);
    // Comma-separated appliance classes, positional: entry N feeds
    // channel N+1 on the hub side.
    let channels = env::var("CHANNELS").unwrap_or_else(|_| "washer,washer,dryer,dryer".to_string());
    let start_prob: f32 = env::var("START_PROB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.05);

    let mut sims: Vec<CycleSim> = channels
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| CycleSim::new(Appliance::from_str_lossy(s), start_prob))
        .collect();
    anyhow::ensure!(!sims.is_empty(), "CHANNELS resolved to no simulators");

    for (i, s) in sims.iter().enumerate() {
        info!(channel = i + 1, appliance = %s.appliance(), "simulating");
    }

    let mut mqttoptions = MqttOptions::new("laundry-node-sim", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Publish-only node, but the event loop must keep polling to hold the
    // connection open.
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = "meters/sim/rpc";
    info!(topic, interval_s = sample_every_s, "publishing");

    loop {
        let mut params = Map::new();
        for (i, s) in sims.iter_mut().enumerate() {
            let power = s.sample();
            params.insert(
                format!("meter:{i}"),
                json!({
                    "id": i,
                    "apower": (power * 10.0).round() / 10.0,
                    "current": (estimate_current(power) * 100.0).round() / 100.0,
                }),
            );
        }
        let payload = Value::Object(Map::from_iter([
            ("method".to_string(), json!("NotifyStatus")),
            ("params".to_string(), Value::Object(params)),
        ]));

        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
        {
            error!("publish failed: {e}");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}
