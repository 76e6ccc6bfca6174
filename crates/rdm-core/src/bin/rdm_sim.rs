#![warn(missing_docs)]

//! Runs a message exchange between two simulated endpoints and prints
//! both sides' counters as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Parser;
use rdm_core::sim::{Loopback, SimConfig, Side};
use rdm_core::{CompletionEvent, EndpointConfig, IoBuf, OpFlags, OpKind, ProtocolError};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rdm-sim")]
#[command(about = "Reliable-datagram loopback simulator", long_about = None)]
struct Args {
    /// Endpoint configuration (TOML or JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Messages to send from a to b.
    #[arg(short, long, default_value = "100")]
    messages: usize,

    /// Bytes per message.
    #[arg(short, long, default_value = "4096")]
    size: usize,

    /// RNR rejections injected at the receiver.
    #[arg(long, default_value = "0")]
    rnr: usize,

    /// Probability that a device post is refused as busy.
    #[arg(long, default_value = "0.0")]
    busy_rate: f64,

    /// Deliver each batch of posts in reverse order.
    #[arg(long)]
    reverse: bool,

    /// Request delivery-complete semantics.
    #[arg(long)]
    delivery_complete: bool,
}

fn message(i: usize, size: usize) -> Bytes {
    Bytes::from(vec![(i % 251) as u8; size])
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) if path.exists() => EndpointConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            EndpointConfig::default()
        }
        None => EndpointConfig::default(),
    }
    .with_env_overrides(std::env::vars())?;

    let mut lo = Loopback::new(config.clone(), config)?;
    let sim = SimConfig {
        busy_rate: args.busy_rate,
    };
    lo.a.provider_mut().set_config(sim.clone());
    lo.b.provider_mut().set_config(sim);
    lo.inject_rnr(Side::B, args.rnr);
    lo.set_reverse_batches(args.reverse);

    let flags = if args.delivery_complete {
        OpFlags::DELIVERY_COMPLETE
    } else {
        OpFlags::empty()
    };

    tracing::info!(messages = args.messages, size = args.size, "starting exchange");
    let mut recvs = Vec::with_capacity(args.messages);
    for _ in 0..args.messages {
        recvs.push(lo.b.post_recv(Some(lo.b_to_a), args.size, None, OpFlags::empty())?);
    }

    let mut next = 0;
    let mut sent = 0;
    let mut received = Vec::new();
    let mut failures = 0;
    let mut recv_failures = 0;
    let mut rounds = 0u64;
    while sent < args.messages || received.len() + recv_failures < args.messages {
        while next < args.messages {
            let bufs = [IoBuf::host(message(next, args.size))];
            match lo.a.post_operation(lo.a_to_b, OpKind::Send { tag: None }, flags, &bufs) {
                Ok(_) => next += 1,
                Err(ProtocolError::QueueFull { .. } | ProtocolError::PoolExhausted { .. }) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let pumped = lo.pump();
        for event in pumped.a {
            match event {
                CompletionEvent::Success { .. } => sent += 1,
                other => {
                    tracing::warn!(?other, "send did not complete");
                    failures += 1;
                    sent += 1;
                }
            }
        }
        for event in pumped.b {
            match event {
                CompletionEvent::Success { op, data: Some(data), .. } => received.push((op, data)),
                other => {
                    tracing::warn!(?other, "receive did not complete");
                    failures += 1;
                    recv_failures += 1;
                }
            }
        }
        lo.advance(Duration::from_millis(1));
        rounds += 1;
        if rounds > 1_000_000 {
            bail!("exchange did not finish: {sent} sent, {} received", received.len());
        }
    }

    let mut corrupt = 0;
    for (op, data) in &received {
        let index = recvs.iter().position(|r| r == op).unwrap_or(usize::MAX);
        if *data != message(index, args.size) {
            corrupt += 1;
        }
    }

    let report = json!({
        "messages": args.messages,
        "size": args.size,
        "rounds": rounds,
        "failures": failures,
        "corrupt": corrupt,
        "a": lo.a.metrics_snapshot(),
        "b": lo.b.metrics_snapshot(),
        "device_a": lo.a.provider().stats(),
        "device_b": lo.b.provider().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if failures > 0 || corrupt > 0 {
        bail!("{failures} failures, {corrupt} corrupt messages");
    }
    Ok(())
}
