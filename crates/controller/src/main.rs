mod actuator;
mod config;
mod db;
mod decision;
mod error;
mod mqtt;
mod notify;
mod relay;
mod scheduler;
mod sequence;
mod timers;
mod weather;
mod web;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use actuator::{WinterMode, ZoneActuator};
use db::Db;
use mqtt::StatusPublisher;
use notify::Notifier;
use relay::RelayBackend;
use scheduler::Scheduler;
use timers::TimerRegistry;
use weather::WeatherService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.database.url).await?;
    db.init_schema().await?;

    // ── MQTT client (status publishing needs it before the actuator) ─
    let mqtt_parts = cfg.mqtt.enabled.then(|| mqtt::connect(&cfg.mqtt));
    let status = mqtt_parts
        .as_ref()
        .map(|(client, _)| StatusPublisher::new(client.clone(), cfg.mqtt.base_topic.clone()));
    let mqtt_client = mqtt_parts.as_ref().map(|(client, _)| client.clone());

    // ── Core components ─────────────────────────────────────────────
    let notifier = Notifier::new();
    let relay = RelayBackend::from_config(cfg.loxone.clone());
    let actuator = ZoneActuator::new(
        db.clone(),
        relay,
        notifier.clone(),
        WinterMode::default(),
        status,
    );
    web::restore_winter_mode(&db, &actuator).await?;

    let timers = TimerRegistry::new();
    let weather = Arc::new(WeatherService::new(cfg.weather.clone(), db.clone()));
    let scheduler = Scheduler::new(
        db.clone(),
        Arc::clone(&weather),
        Arc::clone(&actuator),
        Arc::clone(&timers),
    );

    // ── Background work ─────────────────────────────────────────────
    let registered = scheduler.reload().await?;
    info!(schedules = registered, "controller started");
    scheduler.spawn_sweep_loop();
    scheduler.reschedule_daily_check().await;
    if cfg.weather.enabled {
        Arc::clone(&weather).spawn_refresh_loop();
    }

    if let Some((client, eventloop)) = mqtt_parts {
        tokio::spawn(mqtt::run(
            eventloop,
            client,
            cfg.mqtt.base_topic.clone(),
            db.clone(),
            Arc::clone(&actuator),
            Arc::clone(&timers),
            notifier.clone(),
        ));
    }

    // ── Web server ──────────────────────────────────────────────────
    let state = web::AppState {
        db,
        weather,
        actuator,
        timers: Arc::clone(&timers),
        scheduler: scheduler.clone(),
        notifier,
    };
    let port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(state, port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    // Active zones are left as-is; only the background machinery stops.
    timers.cancel_all();
    scheduler.shutdown();
    if let Some(client) = mqtt_client {
        let _ = client.disconnect().await;
    }
    Ok(())
}
