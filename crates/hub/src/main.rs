mod config;
mod db;
mod engine;
mod payload;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use engine::{Engine, EngineMsg};
use state::{Machine, MonitorState, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ----------------------------
    // Env config
    // ----------------------------
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:laundry.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ----------------------------
    // Channel config
    // ----------------------------
    let cfg = config::load(&config_path)?;
    if cfg.channels.is_empty() {
        warn!("no channels configured; all telemetry will be ignored");
    }

    // ----------------------------
    // Database
    // ----------------------------
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ----------------------------
    // Shared state (snapshots for the status api)
    // ----------------------------
    let machines: Vec<Machine> = cfg
        .channels
        .iter()
        .flat_map(|c| c.machines.iter())
        .map(|m| Machine::idle(m.id, m.name.clone()))
        .collect();
    let shared: SharedState = Arc::new(RwLock::new(MonitorState::new(machines)));
    {
        let mut st = shared.write().await;
        st.record_system("hub started".to_string());
    }

    // ----------------------------
    // Engine
    // ----------------------------
    let (events_tx, _) = broadcast::channel(64);
    let (engine_tx, engine_rx) = mpsc::channel(256);
    let engine = Engine::new(
        &cfg,
        db.clone(),
        shared.clone(),
        events_tx.clone(),
        engine_tx.clone(),
    );
    tokio::spawn(engine.run(engine_rx));

    // Keep one subscriber alive so every transition lands in the log;
    // other consumers come and go freely.
    let mut log_rx = events_tx.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = log_rx.recv().await {
            info!(
                machine = ev.machine.id,
                name = %ev.machine.name,
                kind = ?ev.kind,
                "machine event"
            );
        }
    });

    // ----------------------------
    // Status api
    // ----------------------------
    let app_state = web::AppState {
        shared: shared.clone(),
        db: db.clone(),
        names: Arc::new(cfg.machine_names()),
    };
    tokio::spawn(web::serve(app_state));

    // ----------------------------
    // MQTT
    // ----------------------------
    let mut mqttoptions = MqttOptions::new("laundry-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                {
                    let mut st = shared.write().await;
                    st.note_message(&p.payload);
                }
                // Topic is informational only; payload shape decides
                // whether this message carries power telemetry.
                for reading in payload::normalize(&p.payload) {
                    if engine_tx.send(EngineMsg::Reading(reading)).await.is_err() {
                        error!("engine task gone; shutting down");
                        return Ok(());
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // (Re)subscribe on every connect; the broker forgets our
                // wildcard subscription across clean sessions.
                if let Err(e) = client.subscribe("#", QoS::AtLeastOnce).await {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
