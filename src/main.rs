mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::client::KeelClient;
use cli::{Cli, Commands};
use keel::monitoring::TracingConfig;
use keel::registry::ImageReference;
use keel::server::ApiServer;
use keel::types::{ContainerInfo, ExecChunk, RunRequest};
use keel::{KeelConfig, KeelRuntime};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen } => serve(cli.config, cli.verbose, listen).await,
        command => {
            // Client commands log to stderr only
            let level = if cli.verbose { "debug" } else { "warn" };
            let _guard = TracingConfig {
                log_level: level.to_string(),
                ..TracingConfig::default()
            }
            .init_tracing()?;
            run_client(KeelClient::new(&cli.host), command).await
        }
    }
}

async fn serve(config_path: Option<std::path::PathBuf>, verbose: bool, listen: Option<String>) -> Result<()> {
    let mut config = KeelConfig::load(config_path.as_deref())?;
    if verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    config.validate()?;

    let _guard = config.tracing().init_tracing()?;
    info!("🚀 Keel starting up...");

    let listen: std::net::SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;
    let runtime = Arc::new(KeelRuntime::new(config).await?);

    ApiServer::new(Arc::clone(&runtime), listen)
        .run(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    info!("👋 Keel stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn run_client(client: KeelClient, command: Commands) -> Result<()> {
    match command {
        Commands::Serve { .. } => anyhow::bail!("serve is not a client command"),

        Commands::Ps { status } => {
            let containers = client.list_containers(status.as_deref()).await?;
            print_containers(&containers);
        }

        Commands::Images => {
            let images = client.list_images().await?;
            println!(
                "{:<30} {:<15} {:<14} {:<12} {:<8}",
                "REPOSITORY", "TAG", "IMAGE ID", "SIZE", "IN USE"
            );
            for image in &images {
                println!(
                    "{:<30} {:<15} {:<14} {:<12} {:<8}",
                    image.repository,
                    image.tag,
                    image.short_id,
                    human_size(image.size),
                    if image.in_use { "yes" } else { "" }
                );
            }
        }

        Commands::Run {
            image,
            name,
            ports,
            env,
            restart,
            memory,
            command,
        } => {
            let request = RunRequest {
                image,
                name,
                ports,
                command: (!command.is_empty()).then(|| command.join(" ")),
                env,
                restart,
                memory,
            };
            let container = client.run(&request).await?;
            println!("{}", container.id);
        }

        Commands::Start { containers } => {
            for id in containers {
                let container = client.container_action(&id, "start").await?;
                println!("{}", container.id);
            }
        }

        Commands::Stop { containers } => {
            for id in containers {
                let container = client.container_action(&id, "stop").await?;
                println!("{}", container.id);
            }
        }

        Commands::Pause { containers } => {
            for id in containers {
                let container = client.container_action(&id, "pause").await?;
                println!("{}", container.id);
            }
        }

        Commands::Unpause { containers } => {
            for id in containers {
                let container = client.container_action(&id, "unpause").await?;
                println!("{}", container.id);
            }
        }

        Commands::Rm { containers } => {
            for id in containers {
                client.remove(&id).await?;
                println!("{}", id);
            }
        }

        Commands::Inspect { container } => {
            let container = client.inspect(&container).await?;
            println!("{}", serde_json::to_string_pretty(&container)?);
        }

        Commands::Pull { image } => {
            let reference = ImageReference::parse(&image)?;
            let pulled = client.pull(&reference.repository, &reference.tag).await?;
            println!("{}:{} {}", pulled.repository, pulled.tag, pulled.id);
        }

        Commands::Rmi { images } => {
            for reference in images {
                for removed in client.remove_image(&reference).await? {
                    println!("Untagged: {}:{}", removed.repository, removed.tag);
                }
            }
        }

        Commands::Build { path, tag } => {
            let built = client.build(&path, &tag).await?;
            println!("Built {}:{} {}", built.repository, built.tag, built.id);
        }

        Commands::Exec { container, command } => {
            let code = client
                .exec(&container, &command.join(" "), |chunk| match chunk {
                    ExecChunk::Stdout { data } => {
                        print!("{}", data);
                        let _ = std::io::stdout().flush();
                    }
                    ExecChunk::Stderr { data } => eprint!("{}", data),
                    ExecChunk::Exit { .. } => {}
                })
                .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Logs { container, follow } => {
            client
                .logs(&container, follow, |entry| match entry.stream {
                    keel::streams::StreamKind::Stdout => println!("{}", entry.line),
                    keel::streams::StreamKind::Stderr => eprintln!("{}", entry.line),
                })
                .await?;
        }

        Commands::Stats => {
            let stats = client.stats().await?;
            println!("Host:       {} ({} CPUs)", stats.hostname, stats.cpus);
            println!("Backend:    {}", stats.backend);
            println!(
                "Containers: {} (running: {}, paused: {}, stopped: {})",
                stats.total_containers,
                stats.running_containers,
                stats.paused_containers,
                stats.stopped_containers
            );
            println!("Images:     {}", stats.total_images);
        }

        Commands::Events => {
            client
                .events(|event, data| println!("{} {}", event, data))
                .await?;
        }
    }

    Ok(())
}

fn print_containers(containers: &[ContainerInfo]) {
    println!(
        "{:<12} {:<25} {:<20} {:<28} {:<20} {:<15}",
        "CONTAINER ID", "IMAGE", "COMMAND", "STATUS", "PORTS", "NAMES"
    );
    for container in containers {
        println!(
            "{:<12} {:<25} {:<20} {:<28} {:<20} {:<15}",
            container.id.chars().take(12).collect::<String>(),
            truncate(&container.image, 24),
            truncate(&container.command.join(" "), 19),
            container.status_text,
            container.ports.join(", "),
            container.name
        );
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        format!("{}...", value.chars().take(max.saturating_sub(3)).collect::<String>())
    } else {
        value.to_string()
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    format!("{:.1}{}", size, UNITS[unit])
}
