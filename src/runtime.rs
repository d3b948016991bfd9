//! Tokio scaffolding for driving the gateway loop.
//!
//! The gateway core is synchronous and sans-IO; this module wraps it in a
//! single task that ticks it on a fixed interval, feeds it serial bytes
//! received from the UART task, and surfaces [`GatewayEvent`]s through an
//! asynchronous channel.

// Numan Thabit 2025

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    config::ConfigStore,
    gateway::{Gateway, GatewayEvent, Link, TimeSource},
};

/// Parameters controlling how the gateway task is driven.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between gateway ticks.
    pub tick: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

/// Commands accepted by a running gateway task.
#[derive(Debug)]
pub enum GatewayCommand {
    /// Raw bytes read from the sensor UART.
    SerialBytes(Bytes),
    /// Long-press factory reset from the button handler.
    FactoryReset,
    /// Stop the task.
    Shutdown,
}

/// Handle to a spawned gateway task.
#[derive(Debug)]
pub struct GatewayHandle {
    commands: Sender<GatewayCommand>,
    events: Receiver<GatewayEvent>,
    join: JoinHandle<()>,
}

impl GatewayHandle {
    /// Forwards UART bytes to the gateway. Returns `false` once the task
    /// has stopped.
    pub async fn serial_bytes(&self, bytes: Bytes) -> bool {
        self.commands
            .send(GatewayCommand::SerialBytes(bytes))
            .await
            .is_ok()
    }

    /// Requests a factory reset.
    pub async fn factory_reset(&self) -> bool {
        self.commands
            .send(GatewayCommand::FactoryReset)
            .await
            .is_ok()
    }

    /// Receives the next gateway event, or `None` once the task stopped.
    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(GatewayCommand::Shutdown).await;
        let _ = self.join.await;
    }
}

/// Spawns the gateway on the current tokio runtime.
pub fn spawn_gateway<L, C, T>(mut gateway: Gateway<L, C, T>, config: RuntimeConfig) -> GatewayHandle
where
    L: Link + Send + 'static,
    L::Stream: Send,
    C: ConfigStore + Send + 'static,
    T: TimeSource + Send + 'static,
{
    let (command_tx, mut command_rx) = mpsc::channel(config.command_buffer.max(1));
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));

    let join = tokio::spawn(async move {
        let mut ticker = time::interval(config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let events = tokio::select! {
                command = command_rx.recv() => match command {
                    Some(GatewayCommand::SerialBytes(bytes)) => {
                        gateway.on_serial_bytes(&bytes, Instant::now())
                    }
                    Some(GatewayCommand::FactoryReset) => match gateway.factory_reset() {
                        Ok(events) => events,
                        Err(err) => {
                            warn!(%err, "factory reset failed");
                            Vec::new()
                        }
                    },
                    Some(GatewayCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => gateway.tick(Instant::now()),
            };

            for event in events {
                if event_tx.send(event).await.is_err() {
                    debug!("event channel closed, stopping gateway task");
                    return;
                }
            }
        }
        debug!("gateway task stopped");
    });

    GatewayHandle {
        commands: command_tx,
        events: event_rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeviceConfig, DeviceIdentity, MemoryStore},
        metrics::Metrics,
        serial::NOT_READY_BYTE,
    };
    use std::{io, sync::Arc};

    /// Link that is always down; the runtime test never opens a socket.
    struct DownLink;

    impl Link for DownLink {
        type Stream = std::net::TcpStream;

        fn is_up(&self) -> bool {
            false
        }

        fn resolvable(&self, _host: &str) -> bool {
            false
        }

        fn connect(
            &mut self,
            _host: &str,
            _port: u16,
            _timeout: Duration,
        ) -> io::Result<Self::Stream> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "link down"))
        }
    }

    struct NoTime;

    impl TimeSource for NoTime {
        fn time_valid(&self) -> bool {
            false
        }

        fn unix_timestamp(&self) -> u64 {
            0
        }
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            model: "GW-1".into(),
            serial: "SN1".into(),
            mac: "00:00:00:00:00:01".into(),
            hw_rev: "1.0".into(),
            fw_rev: "1.0".into(),
            device_class: "1".into(),
        }
    }

    #[tokio::test]
    async fn wake_reply_flows_through_the_task() {
        let gateway = Gateway::new(
            DownLink,
            MemoryStore::new(DeviceConfig::default()),
            NoTime,
            identity(),
            Arc::new(Metrics::new().expect("metrics")),
        );
        let mut handle = spawn_gateway(gateway, RuntimeConfig::default());

        assert!(handle.serial_bytes(Bytes::from_static(&[0x00])).await);
        let event = handle.next_event().await.expect("event");
        assert_eq!(
            event,
            GatewayEvent::SerialTx(Bytes::from_static(&[NOT_READY_BYTE]))
        );

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let gateway = Gateway::new(
            DownLink,
            MemoryStore::new(DeviceConfig::default()),
            NoTime,
            identity(),
            Arc::new(Metrics::new().expect("metrics")),
        );
        let handle = spawn_gateway(gateway, RuntimeConfig::default());
        handle.shutdown().await;
    }
}
