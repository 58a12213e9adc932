//! Albor RLC Loopback Harness
//!
//! Drives a gNB side and a UE side RLC bearer against each other over a
//! simulated MAC channel that grants a fixed number of bytes per slot and
//! drops PDUs with a configured probability.

mod config;

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::types::{Lcid, UeIndex};
use config::HarnessConfig;
use layers::rlc::{RlcConfig, RlcEvent, RlcLayer, RlcMetrics, RlcMode};
use layers::{LayerError, ProtocolLayer};

/// Albor RLC loopback harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Number of SDUs to transfer
    #[arg(long)]
    nof_sdus: Option<u32>,

    /// Bytes granted to each peer per slot
    #[arg(long)]
    grant: Option<usize>,

    /// PDU loss probability (0 <= p < 1)
    #[arg(long)]
    loss: Option<f64>,
}

/// Outcome of one loopback run
#[derive(Debug, Default, Serialize)]
struct LoopbackReport {
    slots: u64,
    sdus_sent: u32,
    sdus_received: u32,
    sdus_delivered: u32,
    corrupted_sdus: u32,
    out_of_order_sdus: u32,
    pdus_lost_dl: u64,
    pdus_lost_ul: u64,
    max_retx_events: u32,
    protocol_failures: u32,
    gnb: RlcMetrics,
    ue: RlcMetrics,
}

/// SDU tagged with its index so the receiving side can verify it
fn make_sdu(index: u32, size: usize) -> Bytes {
    let mut sdu = BytesMut::with_capacity(size);
    sdu.put_u32(index);
    sdu.put_bytes(index as u8, size - 4);
    sdu.freeze()
}

/// Index carried by an SDU, if its content matches the generated pattern
fn check_sdu(sdu: &[u8], size: usize) -> Option<u32> {
    if sdu.len() != size || sdu.len() < 4 {
        return None;
    }
    let index = u32::from_be_bytes([sdu[0], sdu[1], sdu[2], sdu[3]]);
    sdu[4..].iter().all(|&b| b == index as u8).then_some(index)
}

/// Configuration of the UE side, mirroring the gNB direction
fn peer_config(config: &RlcConfig) -> RlcConfig {
    let mut peer = config.clone();
    if config.mode == RlcMode::UmUnidirDl {
        peer.mode = RlcMode::UmUnidirUl;
    }
    peer
}

/// Deliver a PDU to a peer; per-PDU RLC errors are expected on a lossy channel
async fn deliver(layer: &mut RlcLayer, pdu: Bytes) -> Result<()> {
    match layer.process_uplink(pdu).await {
        Ok(()) => Ok(()),
        Err(LayerError::Rlc(e)) => {
            debug!("PDU rejected: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_loopback(config: HarnessConfig) -> Result<LoopbackReport> {
    let ue_index = UeIndex::new(config.traffic.ue_index)
        .ok_or_else(|| anyhow::anyhow!("Invalid UE index: {}", config.traffic.ue_index))?;
    let lcid = Lcid::new(config.traffic.lcid)
        .ok_or_else(|| anyhow::anyhow!("Invalid LCID: {}", config.traffic.lcid))?;
    if !config.rlc.mode.has_tx() {
        anyhow::bail!("Mode {} has no transmitting side at the gNB", config.rlc.mode);
    }
    let am = config.rlc.mode == RlcMode::Am;
    let ue_config = peer_config(&config.rlc);
    let ue_has_tx = ue_config.mode.has_tx();

    let mut gnb = RlcLayer::new(ue_index, lcid, config.rlc.clone());
    let mut ue = RlcLayer::new(ue_index, lcid, ue_config);
    let mut gnb_events = gnb.create_channels();
    let mut ue_events = ue.create_channels();
    gnb.initialize().await?;
    ue.initialize().await?;

    let channel = &config.channel;
    let traffic = &config.traffic;
    let mut rng = StdRng::seed_from_u64(channel.seed);
    let mut report = LoopbackReport::default();
    let mut next_expected = 0u32;
    let mut gnb_buffer = 0usize;
    let mut idle_slots = 0u64;
    let mut slot_timer = tokio::time::interval(Duration::from_micros(channel.slot_duration_us));

    info!(
        "Starting loopback: mode={} sdus={} size={} grant={} loss={}",
        config.rlc.mode, traffic.nof_sdus, traffic.sdu_size, channel.grant_bytes, channel.loss_probability
    );

    while report.slots < channel.max_slots {
        slot_timer.tick().await;
        report.slots += 1;

        if report.sdus_sent < traffic.nof_sdus {
            let sdu = make_sdu(report.sdus_sent, traffic.sdu_size);
            match gnb.process_downlink(sdu).await {
                Ok(()) => report.sdus_sent += 1,
                Err(LayerError::Rlc(e)) => debug!("SDU {} deferred: {}", report.sdus_sent, e),
                Err(e) => return Err(e.into()),
            }
        }

        // Downlink: gNB -> UE
        let mut activity = false;
        if let Some(pdu) = gnb.pull_pdu(channel.grant_bytes).await? {
            activity = true;
            if rng.gen_bool(channel.loss_probability) {
                report.pdus_lost_dl += 1;
                debug!("Dropped DL PDU of {} bytes", pdu.len());
            } else {
                deliver(&mut ue, pdu).await?;
            }
        }

        // Uplink: UE -> gNB, carries STATUS PDUs in AM
        if ue_has_tx {
            if let Some(pdu) = ue.pull_pdu(channel.grant_bytes).await? {
                activity = true;
                if rng.gen_bool(channel.loss_probability) {
                    report.pdus_lost_ul += 1;
                    debug!("Dropped UL PDU of {} bytes", pdu.len());
                } else {
                    deliver(&mut gnb, pdu).await?;
                }
            }
        }

        drain_ue_events(&mut ue_events, traffic.sdu_size, am, &mut next_expected, &mut report);
        drain_gnb_events(&mut gnb_events, &mut gnb_buffer, &mut report);

        idle_slots = if activity { 0 } else { idle_slots + 1 };
        let all_sent = report.sdus_sent == traffic.nof_sdus;
        if am && report.sdus_delivered == traffic.nof_sdus {
            break;
        }
        if !am && all_sent && gnb_buffer == 0 && (report.sdus_received == traffic.nof_sdus || idle_slots > 1000) {
            break;
        }
        if report.max_retx_events > 0 {
            error!("Maximum retransmissions reached, radio link failure");
            break;
        }
    }

    report.gnb = gnb.metrics().await?;
    report.ue = ue.metrics().await?;
    gnb.shutdown().await?;
    ue.shutdown().await?;
    Ok(report)
}

fn drain_ue_events(
    events: &mut UnboundedReceiver<RlcEvent>,
    sdu_size: usize,
    in_order: bool,
    next_expected: &mut u32,
    report: &mut LoopbackReport,
) {
    while let Ok(event) = events.try_recv() {
        if let RlcEvent::NewSdu(sdu) = event {
            report.sdus_received += 1;
            match check_sdu(&sdu, sdu_size) {
                Some(index) => {
                    if in_order && index != *next_expected {
                        warn!("SDU {} received, expected {}", index, next_expected);
                        report.out_of_order_sdus += 1;
                    }
                    *next_expected = index.wrapping_add(1);
                }
                None => {
                    error!("Corrupted SDU of {} bytes", sdu.len());
                    report.corrupted_sdus += 1;
                }
            }
        }
    }
}

fn drain_gnb_events(events: &mut UnboundedReceiver<RlcEvent>, gnb_buffer: &mut usize, report: &mut LoopbackReport) {
    while let Ok(event) = events.try_recv() {
        match event {
            RlcEvent::DeliveredSdu(_) => report.sdus_delivered += 1,
            RlcEvent::BufferState(bytes) => *gnb_buffer = bytes,
            RlcEvent::MaxRetx => report.max_retx_events += 1,
            RlcEvent::ProtocolFailure(e) => {
                warn!("Protocol failure: {}", e);
                report.protocol_failures += 1;
            }
            RlcEvent::NewSdu(_) | RlcEvent::TransmittedSdu(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_yaml_file(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(nof_sdus) = args.nof_sdus {
        config.traffic.nof_sdus = nof_sdus;
    }
    if let Some(grant) = args.grant {
        config.channel.grant_bytes = grant;
    }
    if let Some(loss) = args.loss {
        config.channel.loss_probability = loss;
    }
    config.validate()?;

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor RLC loopback harness");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }

    let report = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            return Ok(());
        }
        report = run_loopback(config.clone()) => report?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.corrupted_sdus > 0 || report.out_of_order_sdus > 0 {
        anyhow::bail!(
            "Loopback verification failed: {} corrupted, {} out of order",
            report.corrupted_sdus,
            report.out_of_order_sdus
        );
    }
    if config.rlc.mode == RlcMode::Am && report.sdus_delivered != config.traffic.nof_sdus {
        anyhow::bail!(
            "Only {} of {} SDUs acknowledged after {} slots",
            report.sdus_delivered,
            config.traffic.nof_sdus,
            report.slots
        );
    }
    info!("Loopback finished after {} slots", report.slots);
    Ok(())
}
