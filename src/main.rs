use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use message_relay::http::{router, HttpServer};
use message_relay::kafka::{AckConsumer, MessageProducer};
use message_relay::postgres::PgStore;
use message_relay::{Config, MessagePipeline, ShutdownCoordinator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "message-relay")]
#[command(about = "HTTP message intake with Kafka publish and processed acknowledgements", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "APP_CONFIG_PATH",
        default_value = "config.toml"
    )]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Print the recognised environment variables and exit")]
    print_env: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_env {
        println!("{}", Config::env_description());
        return Ok(());
    }

    let config = Config::from_file(&args.config)
        .with_context(|| format!("load configuration from {:?}", args.config))?;

    init_logging(
        args.json_logs || config.environment.is_prod(),
        args.verbose,
        &config.log_level,
    );

    info!(
        environment = config.environment.as_str(),
        http_addr = %config.http.addr,
        kafka_brokers = ?config.kafka.brokers,
        publish_topic = %config.kafka.producer.topic,
        ack_topics = ?config.kafka.consumer.topics,
        consumer_group = %config.kafka.consumer.group,
        "Configuration summary"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let coordinator = ShutdownCoordinator::new();
    let started = start(&config, &coordinator, cancel.clone()).await;
    if let Err(e) = &started {
        error!(error = %e, "startup failed");
        cancel.cancel();
    }

    cancel.cancelled().await;
    info!(
        actions = coordinator.len(),
        timeout_ms = config.shutdown_timeout_ms,
        "Starting graceful shutdown"
    );
    match coordinator.shutdown(config.shutdown_timeout(), 0).await {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => error!(error = %e, "Shutdown finished uncleanly"),
    }

    started
}

/// Opens every component and registers its teardown. Teardown actions are
/// registered as soon as the component exists, so a partial startup is
/// still released.
async fn start(
    config: &Config,
    coordinator: &ShutdownCoordinator,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let producer = Arc::new(MessageProducer::new(&config.kafka).context("create producer")?);
    coordinator.register("messages producer", {
        let producer = producer.clone();
        move |_deadline| async move { producer.close().await }
    });

    let store = Arc::new(
        PgStore::connect(&config.postgres)
            .await
            .context("connect to PostgreSQL")?,
    );
    coordinator.register("postgres pool", {
        let store = store.clone();
        move |_deadline| async move { store.close() }
    });

    if config.postgres.migrate {
        store.migrate().await.context("apply migrations")?;
    }

    let pipeline = MessagePipeline::new(store, producer);

    let consumer = Arc::new(
        AckConsumer::new(&config.kafka, Arc::new(pipeline.clone()))
            .context("create consumer")?,
    );
    coordinator.register("processed messages consumer", {
        let consumer = consumer.clone();
        move |_deadline| async move { consumer.close().await }
    });
    tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start_consume(cancel).await }
    });

    let server = Arc::new(
        HttpServer::start(&config.http.addr, router(pipeline, &config.http))
            .await
            .context("start HTTP server")?,
    );
    coordinator.register("http server", {
        let server = server.clone();
        move |deadline| async move { server.shutdown(deadline).await }
    });

    info!(addr = %server.local_addr(), "message-relay started");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received CTRL+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

fn init_logging(json: bool, verbose: bool, level: &str) {
    let env_filter = if verbose {
        EnvFilter::new("message_relay=debug,librdkafka=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("message_relay={level},librdkafka={level},warn"))
        })
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
