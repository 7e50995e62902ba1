use std::{
    process,
    sync::{Arc, OnceLock},
};

use mqviz::{
    config::Config,
    core::{
        readiness::Readiness,
        reporter::{Reporter, StatisticsSource},
    },
    logger::LoggerManager,
    print_error,
};
use mqviz_mqtt::{MqttProtocol, Session, SessionEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, trace, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_subscriptions_table(cfg: &Config) {
    if cfg.subscriptions.is_empty() {
        warn!("No subscriptions configured, only connection state will be reported");
        return;
    }

    let width = cfg
        .subscriptions
        .iter()
        .map(|s| s.topic.len())
        .max()
        .unwrap_or(0)
        .max("Topic".len());

    info!("{:<width$} | QoS", "Topic", width = width);
    info!("{}-+-{}", "-".repeat(width), "-".repeat(3));
    for sub in &cfg.subscriptions {
        info!("{:<width$} | {}", sub.topic, sub.qos, width = width);
    }
}

/// Logs the session event stream until the session goes away.
async fn follow_events(session: Session) {
    let mut events = session.subscribe_events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatusChanged(status)) => debug!("Event: status -> {}", status),
            Ok(SessionEvent::MessageArrived(message)) => {
                trace!(topic = %message.topic, "Event: {}", message.payload)
            }
            Ok(SessionEvent::Error(message)) => debug!("Event: error: {}", message),
            Err(RecvError::Lagged(skipped)) => warn!("Event stream lagged, {} events skipped", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting mqviz version {}...", env!("CARGO_PKG_VERSION"));
    debug!("{:#?}", cfg.session);
    info!("Log level: {}", cfg.logger.level);

    let protocol = MqttProtocol::new(cfg.session.clone()).unwrap_or_else(|e| {
        error!("Failed to create MQTT protocol client: {}", e);
        process::exit(1);
    });
    let session = Session::new(Arc::new(protocol), cfg.session.clone()).unwrap_or_else(|e| {
        error!("Failed to create session: {}", e);
        process::exit(1);
    });
    info!("Client id: {}", session.client_id());

    session.on_status_change(|status| info!("Connection status: {}", status));
    session.on_connected(|| info!("Broker session established"));
    session.on_error(|message| warn!("Session error: {}", message));
    session.on_queue_full(|size| warn!("Incoming queue full ({} messages), dropping oldest", size));

    let readiness = Readiness::default();
    readiness.start_listening(session.subscribe_status());
    tokio::spawn(follow_events(session.clone()));

    log_subscriptions_table(cfg);
    for sub in &cfg.subscriptions {
        if let Err(e) = session.subscribe_to_topic(&sub.topic, sub.qos) {
            error!("Failed to queue subscription '{}': {}", sub.topic, e);
        }
    }

    info!(
        "Connecting to {}:{}{}",
        cfg.broker.host,
        cfg.broker.port,
        if cfg.session.tls.is_some() { " (TLS)" } else { "" }
    );
    if let Err(e) = session.connect(&cfg.broker.host, cfg.broker.port, cfg.broker.credentials()) {
        // Auto-reconnect takes over after a failed first attempt.
        error!("Initial connect failed: {}", e);
    }

    let reporter = Reporter::new(
        Arc::new(session.clone()) as Arc<dyn StatisticsSource>,
        cfg.reporter.clone(),
        readiness,
    );

    info!("Starting statistics reporter...");

    tokio::select! {
        _ = reporter.run() => {
            error!("Reporter unexpectedly finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");

            if let Err(e) = session.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }

            let info = session.get_connection_info();
            info!(
                "Received {} messages on {} topics",
                info.total_messages, info.active_topics
            );
            info!("Shutdown complete");
        }
    }
    Ok(())
}
