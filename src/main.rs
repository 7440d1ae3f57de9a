use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bidiq::{config, search_state, server, store::PgStore};

#[derive(Parser)]
#[command(name = "bidiq", about = "BidIQ procurement search backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default).
    Serve {
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },
    /// Finalize stale search sessions and exit.
    Recover {
        #[arg(long, default_value_t = 10)]
        max_age_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // OTLP export is opt-in: only wired when the endpoint env var is
    // present, matching how the deployment enables tracing.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        use opentelemetry::KeyValue;
        use opentelemetry_sdk::{trace as sdktrace, Resource};

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "bidiq-backend"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("failed to install OpenTelemetry tracer");
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("LOG_LEVEL")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "bidiq=info,tower_http=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(bidiq::correlation::SanitizingMakeWriter::default()),
        )
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Recover { max_age_minutes }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            let recovered = search_state::recover_stale_searches(&store, max_age_minutes).await;
            println!("{} stale searches finalized", recovered);
            Ok(())
        }
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            let state = server::build_state(cfg).await?;
            server::run_server(state, port).await
        }
        None => {
            let port = cfg.port;
            let state = server::build_state(cfg).await?;
            server::run_server(state, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}
