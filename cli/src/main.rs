// peerlink: local driver for the PeerLink core
//
// Runs two in-process devices over the loopback radio, inspects the chunk
// framing, and manages the persisted link configuration.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use peerlink_core::transport::ble::LoopbackAir;
use peerlink_core::{
    spawn_link, FrameCodec, LinkEvent, LinkHandle, PeerLink, Psm, Role, MAX_CHUNK,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "PeerLink: point-to-point BLE text channel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect two in-process devices over the loopback radio and exchange messages
    Demo {
        /// Message sent by the initiator (repeatable)
        #[arg(short, long = "message", default_value = "hello")]
        messages: Vec<String>,
        /// Bytes returned per channel read
        #[arg(long, default_value_t = MAX_CHUNK)]
        read_limit: usize,
        /// Report every advertisement twice
        #[arg(long)]
        duplicates: bool,
        /// PSM the responder publishes
        #[arg(long)]
        psm: Option<u16>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show how a message is framed into chunks
    Encode { text: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    match cli.command {
        Commands::Demo {
            messages,
            read_limit,
            duplicates,
            psm,
            json,
        } => cmd_demo(config, messages, read_limit, duplicates, psm, json).await,
        Commands::Encode { text } => cmd_encode(&text),
        Commands::Config { action } => cmd_config(config, action),
    }
}

struct Device {
    label: &'static str,
    handle: LinkHandle,
    task: tokio::task::JoinHandle<()>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
}

fn device(label: &'static str, air: &LoopbackAir, config: &config::Config) -> Result<Device> {
    let (event_tx, events) = mpsc::unbounded_channel();
    let link = PeerLink::new(
        Box::new(air.central()),
        Box::new(air.peripheral()),
        config.link.clone(),
    )
    .context("Failed to create link")?
    .with_observer(Arc::new(event_tx));
    let (handle, task) = spawn_link(link);
    Ok(Device {
        label,
        handle,
        task,
        events,
    })
}

/// Forward loopback radio callbacks until nothing is left in flight
async fn settle(air: &LoopbackAir, initiator: &LinkHandle, responder: &LinkHandle) -> Result<()> {
    loop {
        let mut moved = false;
        while let Some(event) = air.next_central_event() {
            initiator.deliver_central(event).await?;
            moved = true;
        }
        while let Some(event) = air.next_peripheral_event() {
            responder.deliver_peripheral(event).await?;
            moved = true;
        }
        initiator.flush().await?;
        responder.flush().await?;
        if !moved {
            return Ok(());
        }
    }
}

fn print_events(device: &mut Device, json: bool) -> Result<Vec<String>> {
    let mut received = Vec::new();
    while let Ok(event) = device.events.try_recv() {
        if json {
            println!("{}", serde_json::to_string(&event).context("Failed to encode event")?);
        } else {
            let tag = format!("[{}]", device.label).bright_cyan();
            match &event {
                LinkEvent::Opened { role } => println!("{} {} channel open", tag, role.to_string().green()),
                LinkEvent::Message { role, data } => {
                    println!("{} {} received {} bytes: {}", tag, role, data.len(), data.bold())
                }
                LinkEvent::Closed { role } => println!("{} {} channel closed", tag, role.to_string().yellow()),
                LinkEvent::Error { role, message } => {
                    println!("{} {} error: {}", tag, role, message.bright_red())
                }
            }
        }
        if let LinkEvent::Message { data, .. } = event {
            received.push(data);
        }
    }
    Ok(received)
}

async fn cmd_demo(
    config: config::Config,
    messages: Vec<String>,
    read_limit: usize,
    duplicates: bool,
    psm: Option<u16>,
    json: bool,
) -> Result<()> {
    let mut air = LoopbackAir::new()
        .with_read_limit(read_limit)
        .with_duplicate_adverts(duplicates);
    if let Some(psm) = psm {
        air = air.with_psm(Psm::new(psm).context("Invalid PSM")?);
    }
    debug!(
        "Loopback air: read_limit={} duplicates={} psm={:?}",
        read_limit, duplicates, psm
    );

    let mut a = device("A", &air, &config)?;
    let mut b = device("B", &air, &config)?;

    if !json {
        println!("{}", "PeerLink loopback demo".bold());
        println!("  A runs the {}, B runs the {}", Role::Initiator, Role::Responder);
        println!();
    }

    b.handle.start_responder().await?;
    a.handle.start_initiator().await?;
    settle(&air, &a.handle, &b.handle).await?;
    print_events(&mut a, json)?;
    print_events(&mut b, json)?;

    if a.handle.active_role().await?.is_none() {
        anyhow::bail!("Devices did not connect");
    }

    for message in &messages {
        let chunks = a.handle.send(message.as_str()).await?;
        if !json {
            println!("{} sent {} chunk(s)", "[A]".bright_cyan(), chunks);
        }
    }
    settle(&air, &a.handle, &b.handle).await?;
    let received = print_events(&mut b, json)?;

    b.handle
        .send(format!("received {} message(s)", received.len()))
        .await?;
    settle(&air, &a.handle, &b.handle).await?;
    print_events(&mut a, json)?;

    a.handle.stop_initiator().await?;
    settle(&air, &a.handle, &b.handle).await?;
    print_events(&mut a, json)?;
    print_events(&mut b, json)?;

    a.handle.shutdown().await?;
    b.handle.shutdown().await?;
    a.task.await.context("Initiator task failed")?;
    b.task.await.context("Responder task failed")?;

    if !json {
        println!();
        println!("{} {} of {} message(s) delivered", "✓".green(), received.len(), messages.len());
    }
    Ok(())
}

fn cmd_encode(text: &str) -> Result<()> {
    let chunks = FrameCodec::encode(text);
    println!("{}", "Framing".bold());
    println!("  message bytes: {}", text.len());
    println!("  chunks:        {}", chunks.len());
    println!();

    for (i, chunk) in chunks.iter().enumerate() {
        let padding = chunk.padding_len();
        println!(
            "  #{:<3} {} payload bytes, {} padding",
            i + 1,
            MAX_CHUNK - padding,
            padding.to_string().dimmed()
        );
    }
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}
