//! Kernel liveness probe.
//!
//! Pings the heartbeat channel once per interval. A ping still unanswered at
//! the next tick counts as a miss; `max_misses` consecutive misses report the
//! kernel as unresponsive and stop the probe. Any reply resets the count.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{LinkEventKind, LinkEventSender};
use crate::error::GatewayError;
use crate::transport::{Channel, Message};

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Time between pings.
    pub interval: Duration,
    /// Consecutive misses before the kernel is reported unresponsive.
    pub max_misses: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_misses: 3,
        }
    }
}

/// Spawns the probe. It runs until `cancel` fires, the channel closes, or the
/// kernel is reported unresponsive.
pub fn spawn(
    channel: Arc<Channel>,
    settings: HeartbeatSettings,
    events: LinkEventSender,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(&channel, settings, &events, &cancel).await;
    })
}

async fn run(
    channel: &Channel,
    settings: HeartbeatSettings,
    events: &LinkEventSender,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut outstanding = false;
    let mut missed = 0u32;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            reply = channel.receive(), if outstanding => match reply {
                Ok(_) => {
                    outstanding = false;
                    missed = 0;
                }
                Err(GatewayError::ChannelClosed) => return,
                Err(error) => tracing::debug!(%error, "bad heartbeat reply"),
            },
            _ = ticker.tick() => {
                if outstanding {
                    missed += 1;
                    tracing::debug!(missed, generation = events.generation(), "heartbeat missed");
                    if missed >= settings.max_misses {
                        tracing::warn!(missed, generation = events.generation(), "kernel unresponsive");
                        events.emit(LinkEventKind::Unresponsive { missed });
                        return;
                    }
                    continue;
                }
                let ping = Bytes::from(uuid::Uuid::new_v4().to_string());
                match channel.send(Message::new(vec![ping])).await {
                    Ok(()) => outstanding = true,
                    Err(GatewayError::ChannelClosed) => return,
                    Err(error) => tracing::debug!(%error, "heartbeat send failed"),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::kernel::LinkEvent;
    use crate::transport::ChannelRole;
    use crate::transport::socket::memory::MemoryTransport;

    fn settings() -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(100),
            max_misses: 3,
        }
    }

    fn channels() -> (Arc<Channel>, Channel) {
        let (a, b) = MemoryTransport::pair();
        (
            Arc::new(Channel::from_transport(
                ChannelRole::Req,
                "mem://hb".to_string(),
                Box::new(a),
            )),
            Channel::from_transport(ChannelRole::Rep, "mem://kernel".to_string(), Box::new(b)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn silent_kernel_is_reported_unresponsive() {
        let (hb, _kernel) = channels();
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let cancel = CancellationToken::new();
        let task = spawn(hb, settings(), LinkEventSender::new(4, tx), cancel);

        let Some(event) = rx.recv().await else {
            panic!("expected an event");
        };
        assert_eq!(event.generation, 4);
        assert!(matches!(
            event.kind,
            LinkEventKind::Unresponsive { missed: 3 }
        ));
        assert!(task.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn echoing_kernel_stays_healthy() {
        let (hb, kernel) = channels();
        let echo = tokio::spawn(async move {
            while let Ok(ping) = kernel.receive().await {
                if kernel.send(ping).await.is_err() {
                    break;
                }
            }
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkEvent>();
        let cancel = CancellationToken::new();
        let task = spawn(hb, settings(), LinkEventSender::new(0, tx), cancel.clone());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        assert!(task.await.is_ok());
        echo.abort();
    }
}
