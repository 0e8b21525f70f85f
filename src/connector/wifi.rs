//! # Wi-Fi Server Connector
//!
//! Connector implementation reaching the Network Server over a Wi-Fi (or
//! any IP) bearer with UDP datagrams. The connector owns its socket and a
//! receive task; received datagrams are parked in the fixed downlink pool
//! and announced to the ServerManager, which gives the slot back through
//! `downlink_received` once the protocol engine has decoded it.

use crate::connector::{
    new_downlink_pool, ConnectionState, Connector, ConnectorEvent, ConnectorInitParams,
    DownlinkSlot, SendOutcome, SendParams, ServerDownlinkMessage,
};
use crate::constants::QUEUE_WAIT;
use crate::error::GatewayError;
use crate::util::{monotonic_ms, AutomatonState, MessagePool, StateCell};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct WifiLink {
    connector_index: usize,
    event_queue: mpsc::Sender<ConnectorEvent>,
    socket: Arc<UdpSocket>,
}

/// Connector for a Wi-Fi network bearer, speaking UDP to the Network
/// Server.
pub struct WifiConnector {
    name: String,
    state: Arc<StateCell>,
    // Link events arrive on tasks outside the connector's own loops.
    connection: Arc<Mutex<ConnectionState>>,
    link: tokio::sync::Mutex<Option<Arc<WifiLink>>>,
    pool: Arc<MessagePool<DownlinkSlot>>,
}

impl WifiConnector {
    pub fn new(name: impl Into<String>) -> Self {
        let connector = WifiConnector {
            name: name.into(),
            state: Arc::new(StateCell::new(AutomatonState::Creating)),
            connection: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            link: tokio::sync::Mutex::new(None),
            pool: new_downlink_pool(),
        };
        connector.state.set(AutomatonState::Created);
        connector
    }

    fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock().expect("connection mutex poisoned") = state;
    }

    async fn current_link(&self) -> Result<Arc<WifiLink>, GatewayError> {
        self.link
            .lock()
            .await
            .as_ref()
            .cloned()
            .ok_or(GatewayError::NotInitialized)
    }

    /// Receive loop: parks each datagram in the downlink pool and notifies
    /// the ServerManager. Runs until the automaton leaves `Running`.
    async fn receive_loop(
        state: Arc<StateCell>,
        pool: Arc<MessagePool<DownlinkSlot>>,
        link: Arc<WifiLink>,
        name: String,
    ) {
        let mut buf = vec![0u8; crate::constants::MAX_UPMESSAGE_LENGTH];
        loop {
            match state.get() {
                AutomatonState::Running => {}
                AutomatonState::Stopping => {
                    state.transition(AutomatonState::Stopping, AutomatonState::Idle);
                    break;
                }
                _ => break,
            }

            let received = match timeout(QUEUE_WAIT, link.socket.recv(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(len)) => len,
                Ok(Err(e)) => {
                    error!("{name}: receive failed: {e}");
                    state.set(AutomatonState::Error);
                    break;
                }
            };

            let data = Bytes::copy_from_slice(&buf[..received]);
            let index = match pool.acquire() {
                Ok(index) => index,
                Err(_) => {
                    warn!("{name}: downlink pool exhausted, datagram dropped");
                    continue;
                }
            };
            let timestamp_ms = monotonic_ms();
            pool.with_slot(index, |slot| {
                slot.timestamp_ms = timestamp_ms;
                slot.data = data.clone();
            });
            pool.mark_ready(index);

            let event = ConnectorEvent::DownlinkReceived(ServerDownlinkMessage {
                connector_index: link.connector_index,
                message_id: index,
                timestamp_ms,
                data,
            });
            if link.event_queue.try_send(event).is_err() {
                warn!("{name}: event queue full, downlink message lost");
                pool.release(index);
            }
        }
        debug!("{name}: receive loop terminated");
    }
}

#[async_trait]
impl Connector for WifiConnector {
    async fn initialize(&self, params: ConnectorInitParams) -> Result<(), GatewayError> {
        if self.state.get() != AutomatonState::Created {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        let settings = params.settings;

        // On a hosted network stack, joining the Wi-Fi network amounts to
        // obtaining a usable local endpoint within the configured timeout.
        self.set_connection(ConnectionState::ConnectingWifi);
        let socket = match timeout(settings.join_timeout(), UdpSocket::bind("0.0.0.0:0")).await {
            Ok(Ok(socket)) => Arc::new(socket),
            Ok(Err(e)) => {
                self.set_connection(ConnectionState::Disconnected);
                self.state.set(AutomatonState::Terminated);
                return Err(GatewayError::Transport(format!(
                    "{}: cannot join network {}: {e}",
                    self.name, settings.network_name
                )));
            }
            Err(_) => {
                self.set_connection(ConnectionState::Disconnected);
                self.state.set(AutomatonState::Terminated);
                return Err(GatewayError::Transport(format!(
                    "{}: network join timed out",
                    self.name
                )));
            }
        };
        self.set_connection(ConnectionState::WifiConnected);
        info!("{}: joined network '{}'", self.name, settings.network_name);

        self.set_connection(ConnectionState::ConnectingServer);
        let target = format!(
            "{}:{}",
            settings.network_server_url, settings.network_server_port
        );
        let server_addr = match timeout(settings.server_timeout(), lookup_host(&target)).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    self.set_connection(ConnectionState::WifiConnected);
                    self.state.set(AutomatonState::Terminated);
                    return Err(GatewayError::Transport(format!(
                        "{}: no address for {target}",
                        self.name
                    )));
                }
            },
            Ok(Err(e)) => {
                self.set_connection(ConnectionState::WifiConnected);
                self.state.set(AutomatonState::Terminated);
                return Err(GatewayError::Transport(format!(
                    "{}: cannot resolve {target}: {e}",
                    self.name
                )));
            }
            Err(_) => {
                self.set_connection(ConnectionState::WifiConnected);
                self.state.set(AutomatonState::Terminated);
                return Err(GatewayError::Transport(format!(
                    "{}: resolving {target} timed out",
                    self.name
                )));
            }
        };
        if let Err(e) = socket.connect(server_addr).await {
            self.set_connection(ConnectionState::WifiConnected);
            self.state.set(AutomatonState::Terminated);
            return Err(GatewayError::Transport(format!(
                "{}: cannot bind server endpoint {server_addr}: {e}",
                self.name
            )));
        }
        self.set_connection(ConnectionState::ServerConnected);
        info!("{}: Network Server endpoint {server_addr}", self.name);

        if settings.sntp_period_secs > 0 && !settings.sntp_server_url.is_empty() {
            if let Err(e) =
                super::sntp::synchronize(&settings.sntp_server_url, settings.server_timeout()).await
            {
                warn!("{}: time sync unavailable: {e}", self.name);
            }
        }

        *self.link.lock().await = Some(Arc::new(WifiLink {
            connector_index: params.connector_index,
            event_queue: params.event_queue,
            socket,
        }));
        self.state.set(AutomatonState::Initialized);
        Ok(())
    }

    async fn start(&self) -> Result<(), GatewayError> {
        if !self.state.transition(AutomatonState::Idle, AutomatonState::Running) {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        let link = self.current_link().await?;
        tokio::spawn(Self::receive_loop(
            Arc::clone(&self.state),
            Arc::clone(&self.pool),
            link,
            self.name.clone(),
        ));
        info!("{}: running", self.name);
        Ok(())
    }

    async fn stop(&self) -> Result<(), GatewayError> {
        if !self.state.transition(AutomatonState::Running, AutomatonState::Stopping) {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        Ok(())
    }

    async fn send(&self, params: SendParams) -> Result<(), GatewayError> {
        if self.state.get() != AutomatonState::Running {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        let link = self.current_link().await?;
        let name = self.name.clone();
        tokio::spawn(async move {
            let outcome = match link.socket.send(&params.data).await {
                Ok(sent) if sent == params.data.len() => SendOutcome::Sent,
                Ok(sent) => {
                    warn!("{name}: short send ({sent}/{} bytes)", params.data.len());
                    SendOutcome::SendFailed
                }
                Err(e) => {
                    warn!("{name}: send failed: {e}");
                    SendOutcome::SendFailed
                }
            };
            let event = ConnectorEvent::ServerMsgEvent {
                message_id: params.message_id,
                outcome,
            };
            if link.event_queue.try_send(event).is_err() {
                warn!("{name}: event queue full, send outcome lost");
            }
        });
        Ok(())
    }

    async fn send_receive(&self, data: &[u8], wait: Duration) -> Result<Bytes, GatewayError> {
        if self.state.get() != AutomatonState::Initialized {
            return Err(GatewayError::InvalidState(self.state.get()));
        }
        let link = self.current_link().await?;

        if let Err(e) = link.socket.send(data).await {
            self.state.set(AutomatonState::Terminated);
            return Err(GatewayError::Transport(format!(
                "{}: probe send failed: {e}",
                self.name
            )));
        }

        let mut buf = vec![0u8; crate::constants::MAX_UPMESSAGE_LENGTH];
        match timeout(wait, link.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                self.state.set(AutomatonState::Idle);
                info!(
                    "{}: first exchange with Network Server ok ({len} bytes)",
                    self.name
                );
                Ok(Bytes::copy_from_slice(&buf[..len]))
            }
            Ok(Err(e)) => {
                self.state.set(AutomatonState::Terminated);
                Err(GatewayError::Transport(format!(
                    "{}: probe receive failed: {e}",
                    self.name
                )))
            }
            Err(_) => {
                self.state.set(AutomatonState::Terminated);
                Err(GatewayError::Transport(format!(
                    "{}: no reply from Network Server",
                    self.name
                )))
            }
        }
    }

    async fn downlink_received(&self, message_id: u8) -> Result<(), GatewayError> {
        if !self.pool.release(message_id) {
            warn!("{}: release of free downlink slot {message_id}", self.name);
        }
        Ok(())
    }

    fn state(&self) -> AutomatonState {
        self.state.get()
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().expect("connection mutex poisoned")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ConnectorSettings;
    use std::net::SocketAddr;

    fn settings(server: SocketAddr) -> ConnectorSettings {
        ConnectorSettings {
            network_name: "test-net".into(),
            network_user: String::new(),
            network_password: String::new(),
            network_join_timeout_ms: 1_000,
            network_server_url: server.ip().to_string(),
            network_server_port: server.port(),
            network_server_timeout_ms: 1_000,
            sntp_server_url: String::new(),
            sntp_period_secs: 0,
            gateway_mac: [0; 6],
        }
    }

    #[tokio::test]
    async fn initialize_and_probe_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let connector = WifiConnector::new("wifi0");
        let (event_tx, _event_rx) = mpsc::channel(8);
        connector
            .initialize(ConnectorInitParams {
                settings: settings(server_addr),
                connector_index: 0,
                event_queue: event_tx,
            })
            .await
            .unwrap();
        assert_eq!(connector.state(), AutomatonState::Initialized);
        assert_eq!(connector.connection_state(), ConnectionState::ServerConnected);

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let reply = connector
            .send_receive(&[1, 2, 3], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&reply[..], &[1, 2, 3]);
        assert_eq!(connector.state(), AutomatonState::Idle);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn probe_timeout_terminates_connector() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let connector = WifiConnector::new("wifi0");
        let (event_tx, _event_rx) = mpsc::channel(8);
        connector
            .initialize(ConnectorInitParams {
                settings: settings(addr),
                connector_index: 0,
                event_queue: event_tx,
            })
            .await
            .unwrap();

        let result = connector
            .send_receive(&[0xAA], Duration::from_millis(100))
            .await;
        assert!(result.is_err());
        assert_eq!(connector.state(), AutomatonState::Terminated);
    }

    #[tokio::test]
    async fn running_receive_loop_delivers_downlinks() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let connector = WifiConnector::new("wifi0");
        let (event_tx, mut event_rx) = mpsc::channel(8);
        connector
            .initialize(ConnectorInitParams {
                settings: settings(server_addr),
                connector_index: 3,
                event_queue: event_tx,
            })
            .await
            .unwrap();

        // Probe to reach Idle, then start the receive loop.
        let probe = tokio::spawn({
            let mut buf = [0u8; 64];
            let server = server;
            async move {
                let (len, peer) = server.recv_from(&mut buf).await.unwrap();
                server.send_to(&buf[..len], peer).await.unwrap();
                (server, peer)
            }
        });
        connector
            .send_receive(&[0x00], Duration::from_secs(1))
            .await
            .unwrap();
        let (server, peer) = probe.await.unwrap();
        connector.start().await.unwrap();

        server.send_to(&[0x02, 0x11, 0x22, 0x04], peer).await.unwrap();
        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnectorEvent::DownlinkReceived(message) => {
                assert_eq!(message.connector_index, 3);
                assert_eq!(&message.data[..], &[0x02, 0x11, 0x22, 0x04]);
                connector.downlink_received(message.message_id).await.unwrap();
            }
            other => panic!("unexpected event: {other:?}"),
        }

        connector.stop().await.unwrap();
    }
}
