//! RLC Bearer Task
//!
//! Runs one `RlcEntity` on its own tokio task. SDUs, PDUs and pull
//! requests are serialised through a command channel; the same task drives
//! the 1 ms timer tick, so entity state is never touched concurrently.

use super::config::RlcConfig;
use super::entity::RlcEntity;
use super::metrics::RlcMetrics;
use super::{
    RlcError, RlcNotifiers, RlcRxUpperLayerDataNotifier, RlcTxLowerLayerNotifier,
    RlcTxUpperLayerControlNotifier, RlcTxUpperLayerDataNotifier,
};
use crate::{LayerError, ProtocolLayer};
use async_trait::async_trait;
use bytes::Bytes;
use common::types::{Lcid, UeIndex};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timer resolution of the bearer task
const TICK_PERIOD: Duration = Duration::from_millis(1);

/// Requests handled by the bearer task
#[derive(Debug)]
enum RlcCommand {
    Sdu {
        sdu: Bytes,
        reply: oneshot::Sender<Result<(), RlcError>>,
    },
    Pdu {
        pdu: Bytes,
        reply: oneshot::Sender<Result<(), RlcError>>,
    },
    Pull {
        grant: usize,
        reply: oneshot::Sender<Result<Option<Bytes>, RlcError>>,
    },
    Metrics {
        reply: oneshot::Sender<RlcMetrics>,
    },
}

/// Notifications forwarded from the entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlcEvent {
    /// Reassembled SDU for the upper layer
    NewSdu(Bytes),
    /// SDU with this SN fully sent
    TransmittedSdu(u32),
    /// SDU with this SN acknowledged by the peer
    DeliveredSdu(u32),
    /// Retransmission limit reached
    MaxRetx,
    /// Peer protocol violation
    ProtocolFailure(RlcError),
    /// New buffer occupancy in bytes
    BufferState(usize),
}

/// Notifier forwarding every callback as an `RlcEvent`
struct ChannelNotifier {
    events: mpsc::UnboundedSender<RlcEvent>,
}

impl ChannelNotifier {
    fn send(&self, event: RlcEvent) {
        // Receiver gone means nobody listens for events
        let _ = self.events.send(event);
    }
}

impl RlcRxUpperLayerDataNotifier for ChannelNotifier {
    fn on_new_sdu(&self, sdu: Bytes) {
        self.send(RlcEvent::NewSdu(sdu));
    }
}

impl RlcTxUpperLayerDataNotifier for ChannelNotifier {
    fn on_transmitted_sdu(&self, sn: u32) {
        self.send(RlcEvent::TransmittedSdu(sn));
    }

    fn on_delivered_sdu(&self, sn: u32) {
        self.send(RlcEvent::DeliveredSdu(sn));
    }
}

impl RlcTxUpperLayerControlNotifier for ChannelNotifier {
    fn on_max_retx(&self) {
        self.send(RlcEvent::MaxRetx);
    }

    fn on_protocol_failure(&self, error: RlcError) {
        self.send(RlcEvent::ProtocolFailure(error));
    }
}

impl RlcTxLowerLayerNotifier for ChannelNotifier {
    fn on_buffer_state_update(&self, bytes: usize) {
        self.send(RlcEvent::BufferState(bytes));
    }
}

/// RLC layer instance serving one bearer
pub struct RlcLayer {
    ue_index: UeIndex,
    lcid: Lcid,
    config: RlcConfig,
    events: Option<mpsc::UnboundedSender<RlcEvent>>,
    commands: Option<mpsc::Sender<RlcCommand>>,
    task: Option<JoinHandle<()>>,
}

impl RlcLayer {
    /// Create a new RLC layer instance
    pub fn new(ue_index: UeIndex, lcid: Lcid, config: RlcConfig) -> Self {
        Self {
            ue_index,
            lcid,
            config,
            events: None,
            commands: None,
            task: None,
        }
    }

    /// Event channel of this bearer; call before `initialize`
    pub fn create_channels(&mut self) -> mpsc::UnboundedReceiver<RlcEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn is_running(&self) -> bool {
        self.commands.is_some()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RlcCommand) -> Result<T, LayerError> {
        let commands = self.commands.as_ref().ok_or(LayerError::NotInitialized)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(build(reply_tx))
            .await
            .map_err(|_| LayerError::InvalidState("RLC bearer task stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| LayerError::InvalidState("RLC bearer task dropped the request".to_string()))
    }

    /// Ask the entity for one PDU of at most `grant` bytes
    pub async fn pull_pdu(&self, grant: usize) -> Result<Option<Bytes>, LayerError> {
        Ok(self.request(|reply| RlcCommand::Pull { grant, reply }).await??)
    }

    /// Snapshot of the bearer counters
    pub async fn metrics(&self) -> Result<RlcMetrics, LayerError> {
        self.request(|reply| RlcCommand::Metrics { reply }).await
    }
}

/// Bearer task: owns the entity until the command channel closes
async fn run_bearer(mut entity: RlcEntity, mut commands: mpsc::Receiver<RlcCommand>) {
    let mut ticker = interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    loop {
        tokio::select! {
            _ = ticker.tick() => entity.tick(),
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    RlcCommand::Sdu { sdu, reply } => {
                        let _ = reply.send(entity.submit_sdu(sdu));
                    }
                    RlcCommand::Pdu { pdu, reply } => {
                        let _ = reply.send(entity.handle_pdu(pdu));
                    }
                    RlcCommand::Pull { grant, reply } => {
                        let _ = reply.send(entity.pull_pdu(grant));
                    }
                    RlcCommand::Metrics { reply } => {
                        let _ = reply.send(entity.metrics());
                    }
                }
            }
        }
    }
    info!(
        "RLC bearer task stopped: ue={} lcid={}",
        entity.ue_index(),
        entity.lcid()
    );
}

#[async_trait]
impl ProtocolLayer for RlcLayer {
    async fn initialize(&mut self) -> Result<(), LayerError> {
        if self.is_running() {
            return Err(LayerError::InvalidState("RLC layer already initialized".to_string()));
        }
        info!(
            "Initializing RLC layer: ue={} lcid={} mode={}",
            self.ue_index, self.lcid, self.config.mode
        );
        let events = self.events.clone().unwrap_or_else(|| mpsc::unbounded_channel().0);
        let notifier = Arc::new(ChannelNotifier { events });
        let notifiers = RlcNotifiers {
            rx_upper_dn: notifier.clone(),
            tx_upper_dn: notifier.clone(),
            tx_upper_cn: notifier.clone(),
            tx_lower_dn: notifier,
        };
        let entity = RlcEntity::new(self.ue_index, self.lcid, &self.config, notifiers)?;

        let (commands_tx, commands_rx) = mpsc::channel(256);
        self.task = Some(tokio::spawn(run_bearer(entity, commands_rx)));
        self.commands = Some(commands_tx);
        info!("RLC layer initialized successfully");
        Ok(())
    }

    async fn process_uplink(&mut self, data: Bytes) -> Result<(), LayerError> {
        debug!("RLC processing uplink PDU: {} bytes", data.len());
        self.request(|reply| RlcCommand::Pdu { pdu: data, reply }).await??;
        Ok(())
    }

    async fn process_downlink(&mut self, data: Bytes) -> Result<(), LayerError> {
        debug!("RLC processing downlink SDU: {} bytes", data.len());
        self.request(|reply| RlcCommand::Sdu { sdu: data, reply }).await??;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), LayerError> {
        info!("Shutting down RLC layer");
        self.commands = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("RLC bearer task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlc::config::{RlcAmConfig, RlcMode, RlcTxAmConfig, RlcUmConfig};

    #[tokio::test]
    async fn test_rlc_initialization() {
        let mut rlc = RlcLayer::new(UeIndex(0), Lcid::SRB1, RlcConfig::default());
        assert!(matches!(rlc.pull_pdu(100).await, Err(LayerError::NotInitialized)));
        assert!(rlc.initialize().await.is_ok());
        assert!(rlc.initialize().await.is_err());
        assert!(rlc.shutdown().await.is_ok());
        assert!(!rlc.is_running());
    }

    #[tokio::test]
    async fn test_am_bearer_loopback() {
        // Long t-PollRetransmit keeps wall-clock ticks from adding retransmissions
        let config = RlcConfig::am(RlcAmConfig {
            tx: RlcTxAmConfig {
                t_poll_retx: 1000,
                ..Default::default()
            },
            ..Default::default()
        });
        let mut gnb = RlcLayer::new(UeIndex(3), Lcid(4), config.clone());
        let mut ue = RlcLayer::new(UeIndex(3), Lcid(4), config);
        let mut gnb_events = gnb.create_channels();
        let mut ue_events = ue.create_channels();
        gnb.initialize().await.unwrap();
        ue.initialize().await.unwrap();

        for i in 0..5u8 {
            gnb.process_downlink(Bytes::from(vec![i; 300])).await.unwrap();
        }
        while let Some(pdu) = gnb.pull_pdu(128).await.unwrap() {
            ue.process_uplink(pdu).await.unwrap();
        }
        let status = ue.pull_pdu(128).await.unwrap().expect("status after final poll");
        gnb.process_uplink(status).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = ue_events.try_recv() {
            if let RlcEvent::NewSdu(sdu) = event {
                received.push(sdu);
            }
        }
        assert_eq!(received.len(), 5);
        assert_eq!(received[4], Bytes::from(vec![4u8; 300]));

        let mut delivered = Vec::new();
        while let Ok(event) = gnb_events.try_recv() {
            if let RlcEvent::DeliveredSdu(sn) = event {
                delivered.push(sn);
            }
        }
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);

        let metrics = gnb.metrics().await.unwrap();
        assert_eq!(metrics.tx.num_sdus, 5);
        assert_eq!(metrics.tx.num_status_pdus, 1);

        gnb.shutdown().await.unwrap();
        ue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_errors_surface_as_layer_errors() {
        let config = RlcConfig::um(RlcMode::UmUnidirUl, RlcUmConfig::default());
        let mut rlc = RlcLayer::new(UeIndex(1), Lcid(5), config);
        rlc.initialize().await.unwrap();
        let result = rlc.process_downlink(Bytes::from_static(b"sdu")).await;
        assert!(matches!(
            result,
            Err(LayerError::Rlc(RlcError::DirectionNotConfigured("Tx")))
        ));
        rlc.shutdown().await.unwrap();
    }
}
