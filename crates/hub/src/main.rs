//! Controller daemon entry point: parses the CLI, loads config, wires the
//! GPIO layer and the MQTT notifier, and drives the controller loop.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → all valves off before exit
//! - Software watchdog: the loop kicks a heartbeat; 15 missed 8 s checks
//!   abort the process
//! - MQTT last-will announces an unexpected death on `sprinklerd/status`

mod clock;
mod config;
mod controller;
mod flow;
mod hal;
mod logger;
mod notifier;
mod program;
mod queue;
mod scheduler;
mod sensor;
mod station;

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

use clock::{Clock, SystemClock};
use controller::Controller;

/// Watchdog check period.
const WATCHDOG_INTERVAL_SEC: u64 = 8;

/// Missed heartbeat checks tolerated before the process is aborted.
const WATCHDOG_MISS_LIMIT: u32 = 15;

#[derive(Parser)]
#[command(name = "sprinklerd", about = "Sprinkler irrigation controller daemon")]
struct Args {
    /// Data directory holding config.toml and logs/.
    #[arg(short = 'd', long = "data-dir", default_value = ".")]
    data_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = args.data_dir.join("config.toml");
    let cfg = if config_path.exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path.display(), "no config file, starting with defaults");
        config::parse("")?
    };

    // ── GPIO ────────────────────────────────────────────────────────
    #[cfg(feature = "gpio")]
    let mut gpio = {
        use anyhow::Context;
        let station_pins: Vec<u8> = cfg
            .stations
            .iter()
            .map(|s| {
                s.gpio_pin
                    .with_context(|| format!("station '{}' has no gpio_pin", s.name))
            })
            .collect::<Result<_>>()?;
        let mut sensor_pins = Vec::new();
        for s in [cfg.options.sensor1, cfg.options.sensor2] {
            if s.kind != config::SensorType::None {
                sensor_pins.push(s.pin);
            }
        }
        let active_low = env::var("RELAY_ACTIVE_LOW")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        hal::RpiGpio::new(&station_pins, &sensor_pins, active_low)?
    };
    #[cfg(not(feature = "gpio"))]
    let mut gpio = {
        info!("gpio feature disabled, using mock valve outputs");
        hal::MockGpio::new()
    };

    // ── Controller ──────────────────────────────────────────────────
    let clock = SystemClock::new(cfg.options.timezone_minutes);
    let mut controller = Controller::new(cfg, &args.data_dir);
    info!(
        stations = controller.nstations(),
        programs = controller.programs.len(),
        "controller ready"
    );

    // ── MQTT notifier transport ─────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);

    let mut mqttoptions = MqttOptions::new("sprinklerd", &broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_last_will(LastWill::new(
        "sprinklerd/status",
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Software watchdog ───────────────────────────────────────────
    // A plain thread, so a wedged runtime cannot take the checker with it.
    let heartbeat = Arc::new(AtomicU64::new(0));
    {
        let hb = Arc::clone(&heartbeat);
        std::thread::spawn(move || {
            let mut last = hb.load(Ordering::Relaxed);
            let mut misses = 0u32;
            loop {
                std::thread::sleep(Duration::from_secs(WATCHDOG_INTERVAL_SEC));
                let current = hb.load(Ordering::Relaxed);
                if current == last {
                    misses += 1;
                    warn!(misses, "main loop heartbeat missed");
                } else {
                    misses = 0;
                }
                last = current;
                if misses >= WATCHDOG_MISS_LIMIT {
                    error!("watchdog expired, aborting");
                    std::process::abort();
                }
            }
        });
    }

    // ── Signals ─────────────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // ── Main loop ───────────────────────────────────────────────────
    // The flow sampler wants a look at its pin every millisecond; all
    // slower cadences gate themselves inside the controller.
    let mut tick = tokio::time::interval(Duration::from_millis(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let exit_reason: String;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                heartbeat.fetch_add(1, Ordering::Relaxed);
                controller.poll(&clock, &mut gpio);

                if controller.take_ntp_request() {
                    // The host OS disciplines the clock on this platform;
                    // the anomaly filter still catches a stuck RTC.
                    let t = clock.now_tz();
                    if !controller.apply_ntp_result(t) {
                        warn!(t, "clock sync checkpoint rejected");
                    }
                }
                if controller.take_weather_request() {
                    debug!("weather adjustment due, no weather service configured");
                }

                drain_notifications(&mut controller, &client).await;

                if let Some(cause) = controller.take_pending_reboot() {
                    exit_reason = format!("reboot ({})", cause.as_str());
                    break;
                }
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match notifier::command_verb(&p.topic) {
                        Some(verb) => match notifier::parse_command(verb, &p.payload) {
                            Ok(cmd) => {
                                info!(?cmd, "command received");
                                dispatch_command(&mut controller, clock.now_tz(), &mut gpio, cmd);
                            }
                            Err(e) => warn!("rejected command: {e}"),
                        },
                        None => warn!(topic = %p.topic, "unhandled topic"),
                    }
                }

                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    controller.set_network(true);

                    // Re-subscribe on every (re)connect; the broker may
                    // have lost our session.
                    if let Err(e) = client.subscribe("sprinklerd/cmd/+", QoS::AtLeastOnce).await {
                        error!("re-subscribe sprinklerd/cmd/+ failed: {e}");
                    }
                    let _ = client
                        .publish("sprinklerd/status", QoS::AtLeastOnce, true, b"online".to_vec())
                        .await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    controller.set_network(false);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("mqtt error: {e}");
                    controller.set_network(false);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT".to_string();
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM".to_string();
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(reason = %exit_reason, "shutting down, turning all valves off");
    controller.reset_all_stations_immediate(&mut gpio);
    let _ = client
        .publish("sprinklerd/status", QoS::AtLeastOnce, true, b"offline".to_vec())
        .await;
    info!("shutdown complete");
    Ok(())
}

fn dispatch_command(
    controller: &mut Controller,
    now: i64,
    gpio: &mut impl hal::Gpio,
    cmd: notifier::Command,
) {
    use notifier::Command;
    match cmd {
        Command::RunProgram { pid } => controller.manual_start_program(now, pid, false, gpio),
        Command::StopAll => controller.reset_all_stations(),
        Command::StopAllNow => controller.reset_all_stations_immediate(gpio),
        Command::Pause { secs } => controller.pause_queue(now, secs),
        Command::RainDelay { hours } => {
            controller.set_rain_delay(if hours > 0 { now + hours * 3600 } else { 0 })
        }
        Command::WaterLevel { pct } => controller.apply_weather_result(now, pct),
    }
}

/// Publish queued notifications while the broker connection is up. Events
/// raised offline stay queued for the next connection.
async fn drain_notifications(controller: &mut Controller, client: &AsyncClient) {
    if !controller.status.network_up {
        return;
    }
    while let Some(event) = controller.notif.pop() {
        let (suffix, payload) = event.to_mqtt();
        let topic = format!("sprinklerd/event/{suffix}");
        if let Err(e) = client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string().into_bytes())
            .await
        {
            error!("failed to publish notification: {e}");
            break;
        }
    }
}
