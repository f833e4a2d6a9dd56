//! Moving activations between adjacent stages.

use tokio::sync::mpsc;

use super::error::{DistributedError, Result};
use super::pipeline::IntermediateActivation;

/// Blocking point-to-point link to the neighbouring stages.
///
/// One send and one receive per forward call; ordering is the order of calls.
pub trait StageTransport: Send {
    /// Hand the activation to the next stage, giving up ownership.
    fn send(&mut self, activation: IntermediateActivation) -> Result<()>;

    /// Wait for the previous stage's activation.
    fn recv(&mut self) -> Result<IntermediateActivation>;
}

/// In-process transport over bounded `tokio` channels.
///
/// Uses the blocking channel methods, so it must not be driven from inside an
/// async runtime worker thread.
pub struct ChannelTransport {
    stage_id: usize,
    inbound: Option<mpsc::Receiver<IntermediateActivation>>,
    outbound: Option<mpsc::Sender<IntermediateActivation>>,
}

impl ChannelTransport {
    /// Wire `num_stages` transports into a chain `0 -> 1 -> ... -> n-1`.
    pub fn chain(num_stages: usize, capacity: usize) -> Vec<ChannelTransport> {
        let mut transports: Vec<ChannelTransport> = (0..num_stages)
            .map(|stage_id| ChannelTransport {
                stage_id,
                inbound: None,
                outbound: None,
            })
            .collect();
        for stage_id in 1..num_stages {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            transports[stage_id - 1].outbound = Some(tx);
            transports[stage_id].inbound = Some(rx);
        }
        transports
    }

    pub fn stage_id(&self) -> usize {
        self.stage_id
    }
}

impl StageTransport for ChannelTransport {
    fn send(&mut self, activation: IntermediateActivation) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(DistributedError::WrongStage {
            stage_id: self.stage_id,
            op: "send to a next stage",
        })?;
        tracing::trace!(stage = self.stage_id, "sending activation");
        tx.blocking_send(activation)
            .map_err(|_| DistributedError::ChannelClosed { op: "send" })
    }

    fn recv(&mut self) -> Result<IntermediateActivation> {
        let stage_id = self.stage_id;
        let rx = self.inbound.as_mut().ok_or(DistributedError::WrongStage {
            stage_id,
            op: "receive from a previous stage",
        })?;
        let activation = rx
            .blocking_recv()
            .ok_or(DistributedError::ChannelClosed { op: "recv" })?;
        tracing::trace!(stage = stage_id, "received activation");
        Ok(activation)
    }
}
