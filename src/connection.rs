//! Connection lifecycle for the receiver link
//!
//! The link is driven by an explicit state machine. Every input (adapter
//! power changes, transport completions, notifications, timers, owner
//! requests) is an `Event`; `ConnectionStateMachine::handle` turns it into
//! the `Action`s to run. The `ConnectionManager` actor owns the machine
//! and executes those actions against a `Transport` on a single task, so
//! nothing here needs a lock.
//!
//! ```text
//! AwaitingAdapterReady -> LocatingDevice(n) -> Connecting -> DiscoveringService
//!     -> DiscoveringCharacteristic -> Subscribing -> Ready
//! ```
//!
//! Locating is retried a bounded number of times. Once a device is known,
//! reconnection after a disconnect or failure is retried forever.

use crate::hex_dump;
use crate::services;
use crate::types::{G4Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Transport-level identity of a peripheral (a BlueZ address, for instance)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingAdapterReady,
    LocatingDevice { retries_remaining: u32 },
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristic,
    Subscribing,
    Ready,
    /// Link dropped; a reconnect is scheduled
    Disconnected,
    /// Locating gave up; waiting for the owner to restart discovery
    NotFound,
    /// Torn down by the owner; nothing further happens
    Closed,
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::AwaitingAdapterReady => write!(f, "Awaiting Adapter"),
            ConnectionState::LocatingDevice { retries_remaining } => {
                write!(f, "Locating Device ({} retries left)", retries_remaining)
            }
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::DiscoveringService => write!(f, "Discovering Service"),
            ConnectionState::DiscoveringCharacteristic => write!(f, "Discovering Characteristic"),
            ConnectionState::Subscribing => write!(f, "Subscribing"),
            ConnectionState::Ready => write!(f, "Ready"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::NotFound => write!(f, "Not Found"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Configuration for the connection lifecycle
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Service the receiver advertises
    pub service: Uuid,

    /// Characteristic carrying the framed messages
    pub receive_characteristic: Uuid,

    /// Optional characteristic subscribed to for heartbeats
    pub heartbeat_characteristic: Option<Uuid>,

    /// Locate attempts after the first one before giving up
    pub locate_retries: u32,

    /// Delay between locate attempts
    pub locate_backoff: Duration,

    /// Delay before reconnecting after a drop; zero reconnects immediately
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service: services::CGM_SERVICE,
            receive_characteristic: services::RX_CHARACTERISTIC,
            heartbeat_characteristic: None,
            locate_retries: 6,
            locate_backoff: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    /// Characteristics to discover and subscribe to
    pub fn characteristics(&self) -> Vec<Uuid> {
        let mut wanted = vec![self.receive_characteristic];
        wanted.extend(self.heartbeat_characteristic);
        wanted
    }

    fn wants(&self, uuid: &Uuid) -> bool {
        *uuid == self.receive_characteristic || self.heartbeat_characteristic == Some(*uuid)
    }
}

/// A characteristic as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub is_notifying: bool,
}

/// Notifications from the transport; errors are transport-provided text
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AdapterStateChanged {
        powered: bool,
    },
    Connected {
        device: DeviceHandle,
        known_services: Vec<Uuid>,
    },
    ConnectFailed {
        device: DeviceHandle,
        error: Option<String>,
    },
    Disconnected {
        device: DeviceHandle,
        error: Option<String>,
    },
    ServiceDiscovered {
        device: DeviceHandle,
        known_characteristics: Vec<CharacteristicInfo>,
        error: Option<String>,
    },
    CharacteristicsDiscovered {
        device: DeviceHandle,
        characteristics: Vec<CharacteristicInfo>,
        error: Option<String>,
    },
    NotificationStateChanged {
        device: DeviceHandle,
        characteristic: Uuid,
        is_notifying: bool,
        error: Option<String>,
    },
    Notification {
        device: DeviceHandle,
        characteristic: Uuid,
        value: Vec<u8>,
        received_at: DateTime<Utc>,
    },
    NotificationFailed {
        device: DeviceHandle,
        characteristic: Uuid,
        error: String,
    },
}

/// Inputs to the state machine
#[derive(Debug)]
pub enum Event {
    Transport(TransportEvent),
    LocateResult(Result<Vec<DeviceHandle>>),
    LocateRetry { token: u64 },
    ReconnectDue { token: u64 },
    /// Owner asks to locate the device again after `NotFound`
    StartDiscovery,
    /// Owner tears the link down
    Shutdown,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Locate {
        service: Uuid,
    },
    ScheduleLocateRetry {
        after: Duration,
        token: u64,
    },
    Connect(DeviceHandle),
    ScheduleReconnect {
        after: Duration,
        token: u64,
    },
    DiscoverService {
        device: DeviceHandle,
        service: Uuid,
    },
    DiscoverCharacteristics {
        device: DeviceHandle,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Subscribe {
        device: DeviceHandle,
        characteristic: Uuid,
    },
    Disconnect(DeviceHandle),
    LinkReady(DeviceHandle),
    LinkLost,
    DeliverData {
        value: Vec<u8>,
        received_at: DateTime<Utc>,
    },
    DeliverHeartbeat {
        received_at: DateTime<Utc>,
    },
    Report(G4Error),
    Diagnostic(String),
}

/// Pure connection state machine: `(state, event) -> (state, actions)`
#[derive(Debug)]
pub struct ConnectionStateMachine {
    config: ConnectionConfig,
    state: ConnectionState,
    device: Option<DeviceHandle>,
    adapter_ready: bool,
    connect_in_flight: bool,
    locate_in_flight: bool,
    /// Token of the one armed timer; older timers are stale
    timer: Option<u64>,
    next_token: u64,
}

impl ConnectionStateMachine {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: ConnectionState::AwaitingAdapterReady,
            device: None,
            adapter_ready: false,
            connect_in_flight: false,
            locate_in_flight: false,
            timer: None,
            next_token: 0,
        }
    }

    /// Seed a device recovered from a previous run; locating is skipped
    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.device = Some(device);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Apply one event and return the actions to run, in order
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.state == ConnectionState::Closed {
            debug!("Link closed, ignoring {:?}", event);
            return Vec::new();
        }

        match event {
            Event::Transport(event) => self.on_transport(event),
            Event::LocateResult(result) => self.on_locate_result(result),
            Event::LocateRetry { token } => self.on_locate_retry(token),
            Event::ReconnectDue { token } => self.on_reconnect_due(token),
            Event::StartDiscovery => self.start_discovery(),
            Event::Shutdown => self.shutdown(),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::AdapterStateChanged { powered } => self.on_adapter_state(powered),
            TransportEvent::Connected {
                device,
                known_services,
            } => self.on_connected(device, known_services),
            TransportEvent::ConnectFailed { device, error } => {
                if !self.is_device(&device) || self.state != ConnectionState::Connecting {
                    return Vec::new();
                }
                self.connect_in_flight = false;
                let error = G4Error::ConnectFailed(error.unwrap_or_else(|| "no reason given".into()));
                self.drop_link(Some(error), ConnectionState::Connecting)
            }
            TransportEvent::Disconnected { device, error } => {
                if !self.is_device(&device) || !self.is_linking() {
                    return Vec::new();
                }
                self.connect_in_flight = false;
                let mut actions = vec![Action::Diagnostic(format!(
                    "Disconnected from {} (error: {:?})",
                    device, error
                ))];
                actions.extend(
                    self.drop_link(error.map(G4Error::Disconnected), ConnectionState::Disconnected),
                );
                actions
            }
            TransportEvent::ServiceDiscovered {
                device,
                known_characteristics,
                error,
            } => self.on_service_discovered(device, known_characteristics, error),
            TransportEvent::CharacteristicsDiscovered {
                device,
                characteristics,
                error,
            } => {
                if !self.is_device(&device)
                    || self.state != ConnectionState::DiscoveringCharacteristic
                {
                    return Vec::new();
                }
                if let Some(error) = error {
                    return self.drop_link(
                        Some(G4Error::CharacteristicDiscovery(error)),
                        ConnectionState::Connecting,
                    );
                }
                self.subscribe_all(device, &characteristics)
            }
            TransportEvent::NotificationStateChanged {
                device,
                characteristic,
                is_notifying,
                error,
            } => self.on_notification_state(device, characteristic, is_notifying, error),
            TransportEvent::Notification {
                device,
                characteristic,
                value,
                received_at,
            } => {
                if !self.is_device(&device)
                    || !matches!(
                        self.state,
                        ConnectionState::Subscribing | ConnectionState::Ready
                    )
                {
                    return Vec::new();
                }
                if characteristic == self.config.receive_characteristic {
                    vec![Action::DeliverData { value, received_at }]
                } else if self.config.heartbeat_characteristic == Some(characteristic) {
                    vec![Action::DeliverHeartbeat { received_at }]
                } else {
                    Vec::new()
                }
            }
            TransportEvent::NotificationFailed {
                device,
                characteristic,
                error,
            } => {
                if !self.is_device(&device) {
                    return Vec::new();
                }
                vec![Action::Report(G4Error::Notification(format!(
                    "{}: {}",
                    services::label(&characteristic),
                    error
                )))]
            }
        }
    }

    fn on_adapter_state(&mut self, powered: bool) -> Vec<Action> {
        self.adapter_ready = powered;

        if powered {
            if self.state != ConnectionState::AwaitingAdapterReady {
                return Vec::new();
            }
            return match self.device.clone() {
                Some(device) => self.connect(device),
                None => self.begin_locate(self.config.locate_retries),
            };
        }

        match self.state {
            ConnectionState::AwaitingAdapterReady | ConnectionState::NotFound => {
                vec![Action::Diagnostic("Adapter not powered".to_string())]
            }
            _ => {
                let was_ready = self.state.is_ready();
                self.timer = None;
                self.connect_in_flight = false;
                self.locate_in_flight = false;
                self.transition(ConnectionState::AwaitingAdapterReady);

                let mut actions = vec![Action::Diagnostic(
                    "Adapter powered off, waiting for it to return".to_string(),
                )];
                if was_ready {
                    actions.push(Action::LinkLost);
                }
                actions
            }
        }
    }

    fn on_connected(&mut self, device: DeviceHandle, known_services: Vec<Uuid>) -> Vec<Action> {
        if !self.is_device(&device)
            || self.state != ConnectionState::Connecting
            || !self.connect_in_flight
        {
            return Vec::new();
        }
        self.connect_in_flight = false;

        let service = self.config.service;
        if known_services.contains(&service) {
            self.transition(ConnectionState::DiscoveringCharacteristic);
            vec![
                Action::Diagnostic(format!("Connected to {}, service already known", device)),
                Action::DiscoverCharacteristics {
                    device,
                    service,
                    characteristics: self.config.characteristics(),
                },
            ]
        } else {
            self.transition(ConnectionState::DiscoveringService);
            vec![
                Action::Diagnostic(format!("Connected to {}, discovering service", device)),
                Action::DiscoverService { device, service },
            ]
        }
    }

    fn on_service_discovered(
        &mut self,
        device: DeviceHandle,
        known_characteristics: Vec<CharacteristicInfo>,
        error: Option<String>,
    ) -> Vec<Action> {
        if !self.is_device(&device) || self.state != ConnectionState::DiscoveringService {
            return Vec::new();
        }
        if let Some(error) = error {
            return self.drop_link(
                Some(G4Error::ServiceDiscovery(error)),
                ConnectionState::Connecting,
            );
        }

        let receive = self.config.receive_characteristic;
        if known_characteristics.iter().any(|c| c.uuid == receive) {
            let mut actions = vec![Action::Diagnostic(
                "Characteristics already discovered".to_string(),
            )];
            self.transition(ConnectionState::DiscoveringCharacteristic);
            actions.extend(self.subscribe_all(device, &known_characteristics));
            return actions;
        }

        self.transition(ConnectionState::DiscoveringCharacteristic);
        vec![Action::DiscoverCharacteristics {
            device,
            service: self.config.service,
            characteristics: self.config.characteristics(),
        }]
    }

    fn subscribe_all(
        &mut self,
        device: DeviceHandle,
        characteristics: &[CharacteristicInfo],
    ) -> Vec<Action> {
        let receive = self.config.receive_characteristic;
        let Some(receive_info) = characteristics.iter().find(|c| c.uuid == receive) else {
            let error = G4Error::CharacteristicDiscovery(format!(
                "{} characteristic not found",
                services::label(&receive)
            ));
            return self.drop_link(Some(error), ConnectionState::Connecting);
        };

        self.transition(ConnectionState::Subscribing);

        let mut actions = Vec::new();
        for info in characteristics.iter().filter(|c| self.config.wants(&c.uuid)) {
            if info.is_notifying {
                actions.push(Action::Diagnostic(format!(
                    "{} already notifying",
                    services::label(&info.uuid)
                )));
            } else {
                actions.push(Action::Subscribe {
                    device: device.clone(),
                    characteristic: info.uuid,
                });
            }
        }

        if let Some(heartbeat) = self.config.heartbeat_characteristic {
            if !characteristics.iter().any(|c| c.uuid == heartbeat) {
                actions.push(Action::Diagnostic(format!(
                    "{} characteristic not found, continuing without it",
                    services::label(&heartbeat)
                )));
            }
        }

        if receive_info.is_notifying {
            actions.extend(self.link_ready(device));
        }
        actions
    }

    fn on_notification_state(
        &mut self,
        device: DeviceHandle,
        characteristic: Uuid,
        is_notifying: bool,
        error: Option<String>,
    ) -> Vec<Action> {
        if !self.is_device(&device)
            || !matches!(
                self.state,
                ConnectionState::Subscribing | ConnectionState::Ready
            )
        {
            return Vec::new();
        }

        let label = services::label(&characteristic);
        if let Some(error) = error {
            let error = G4Error::NotificationState(format!("{}: {}", label, error));
            if characteristic == self.config.receive_characteristic
                && self.state == ConnectionState::Subscribing
            {
                return self.drop_link(Some(error), ConnectionState::Connecting);
            }
            return vec![Action::Report(error)];
        }

        let mut actions = vec![Action::Diagnostic(format!(
            "{} notifying: {}",
            label, is_notifying
        ))];
        if is_notifying && self.state == ConnectionState::Subscribing {
            actions.extend(self.link_ready(device));
        }
        actions
    }

    fn on_locate_result(&mut self, result: Result<Vec<DeviceHandle>>) -> Vec<Action> {
        let ConnectionState::LocatingDevice { retries_remaining } = self.state else {
            return Vec::new();
        };
        if !self.locate_in_flight {
            return Vec::new();
        }
        self.locate_in_flight = false;

        let mut actions = Vec::new();
        let found = match result {
            Ok(devices) => devices.into_iter().next(),
            Err(error) => {
                actions.push(Action::Report(error));
                None
            }
        };

        if let Some(device) = found {
            actions.push(Action::Diagnostic(format!(
                "Found {} among connected devices",
                device
            )));
            actions.extend(self.connect(device));
        } else if retries_remaining > 0 {
            let token = self.arm_timer();
            actions.push(Action::Diagnostic(format!(
                "Receiver not among connected devices, retrying in {:?}",
                self.config.locate_backoff
            )));
            actions.push(Action::ScheduleLocateRetry {
                after: self.config.locate_backoff,
                token,
            });
        } else {
            self.transition(ConnectionState::NotFound);
            actions.push(Action::Report(G4Error::DeviceNotFound {
                attempts: self.config.locate_retries.saturating_add(1),
            }));
        }
        actions
    }

    fn on_locate_retry(&mut self, token: u64) -> Vec<Action> {
        if !self.take_timer(token) {
            return Vec::new();
        }
        match self.state {
            ConnectionState::LocatingDevice { retries_remaining } if retries_remaining > 0 => {
                self.begin_locate(retries_remaining - 1)
            }
            _ => Vec::new(),
        }
    }

    fn on_reconnect_due(&mut self, token: u64) -> Vec<Action> {
        if !self.take_timer(token) {
            return Vec::new();
        }
        match (self.state, self.device.clone()) {
            (ConnectionState::Connecting | ConnectionState::Disconnected, Some(device)) => {
                self.connect(device)
            }
            _ => Vec::new(),
        }
    }

    fn start_discovery(&mut self) -> Vec<Action> {
        if self.state != ConnectionState::NotFound {
            return vec![Action::Diagnostic(format!(
                "Discovery restart ignored while {}",
                self.state
            ))];
        }
        self.device = None;
        if self.adapter_ready {
            self.begin_locate(self.config.locate_retries)
        } else {
            self.transition(ConnectionState::AwaitingAdapterReady);
            Vec::new()
        }
    }

    fn shutdown(&mut self) -> Vec<Action> {
        let was_ready = self.state.is_ready();
        self.timer = None;
        self.connect_in_flight = false;
        self.locate_in_flight = false;
        self.transition(ConnectionState::Closed);

        let mut actions = vec![Action::Diagnostic("Link shut down".to_string())];
        if was_ready {
            actions.push(Action::LinkLost);
        }
        if let Some(device) = self.device.take() {
            actions.push(Action::Disconnect(device));
        }
        actions
    }

    fn begin_locate(&mut self, retries_remaining: u32) -> Vec<Action> {
        self.transition(ConnectionState::LocatingDevice { retries_remaining });
        self.locate_in_flight = true;
        vec![Action::Locate {
            service: self.config.service,
        }]
    }

    fn connect(&mut self, device: DeviceHandle) -> Vec<Action> {
        self.device = Some(device.clone());
        self.timer = None;
        self.transition(ConnectionState::Connecting);
        if self.connect_in_flight {
            return Vec::new();
        }
        self.connect_in_flight = true;
        vec![Action::Connect(device)]
    }

    /// Report a failed or dropped link and schedule the reconnect
    fn drop_link(&mut self, error: Option<G4Error>, waiting: ConnectionState) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(error) = error {
            actions.push(Action::Report(error));
        }
        if self.state.is_ready() {
            actions.push(Action::LinkLost);
        }

        let Some(device) = self.device.clone() else {
            return actions;
        };
        if self.config.reconnect_delay.is_zero() {
            actions.extend(self.connect(device));
        } else {
            self.transition(waiting);
            let token = self.arm_timer();
            actions.push(Action::ScheduleReconnect {
                after: self.config.reconnect_delay,
                token,
            });
        }
        actions
    }

    fn link_ready(&mut self, device: DeviceHandle) -> Vec<Action> {
        self.transition(ConnectionState::Ready);
        vec![Action::LinkReady(device)]
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Link state: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn arm_timer(&mut self) -> u64 {
        self.next_token += 1;
        self.timer = Some(self.next_token);
        self.next_token
    }

    fn take_timer(&mut self, token: u64) -> bool {
        if self.timer == Some(token) {
            self.timer = None;
            true
        } else {
            false
        }
    }

    fn is_device(&self, device: &DeviceHandle) -> bool {
        self.device.as_ref() == Some(device)
    }

    fn is_linking(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::DiscoveringService
                | ConnectionState::DiscoveringCharacteristic
                | ConnectionState::Subscribing
                | ConnectionState::Ready
        )
    }
}

/// Wireless transport used by the link.
///
/// Requests complete asynchronously: results come back as
/// `TransportEvent`s through the `EventSender` the transport was built
/// with. An `Err` from a request means it was never issued.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn is_adapter_ready(&self) -> Result<bool>;

    /// Devices already connected to the host that expose `service`
    async fn find_connected_devices(&self, service: Uuid) -> Result<Vec<DeviceHandle>>;

    async fn connect(&self, device: &DeviceHandle) -> Result<()>;

    async fn discover_service(&self, device: &DeviceHandle, service: Uuid) -> Result<()>;

    async fn discover_characteristics(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;

    async fn subscribe(&self, device: &DeviceHandle, characteristic: Uuid) -> Result<()>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()>;
}

/// Receives link output on the actor task
pub trait LinkHandler: Send {
    /// Called when the link becomes usable
    fn on_link_ready(&mut self, device: &DeviceHandle) {
        let _ = device;
    }

    fn on_link_lost(&mut self) {}

    /// Raw bytes from the receive characteristic
    fn on_data(&mut self, data: &[u8], received_at: DateTime<Utc>);

    fn on_heartbeat(&mut self, received_at: DateTime<Utc>) {
        let _ = received_at;
    }

    /// Non-fatal error; the link keeps recovering on its own
    fn on_error(&mut self, error: &G4Error);

    fn on_diagnostic(&mut self, text: &str) {
        let _ = text;
    }
}

/// Posts events to a link's actor
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Deliver a transport notification
    pub fn send(&self, event: TransportEvent) -> Result<()> {
        self.post(Event::Transport(event))
    }

    pub fn post(&self, event: Event) -> Result<()> {
        self.tx.send(event).map_err(|_| G4Error::ChannelClosed)
    }
}

/// Actor side of the event queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

/// Create the single-consumer queue feeding a `ConnectionManager`
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Owner's handle on a running link
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    events: EventSender,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Locate the device again after discovery gave up
    pub fn restart_discovery(&self) -> Result<()> {
        self.events.post(Event::StartDiscovery)
    }

    /// Disconnect and stop; the link never reconnects afterwards
    pub fn shutdown(&self) -> Result<()> {
        self.events.post(Event::Shutdown)
    }
}

/// Single-task actor running the state machine against a transport
pub struct ConnectionManager<T, H> {
    machine: ConnectionStateMachine,
    transport: Arc<T>,
    handler: H,
    events: EventSender,
    receiver: EventReceiver,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl<T, H> ConnectionManager<T, H>
where
    T: Transport + 'static,
    H: LinkHandler + 'static,
{
    /// `events` must be the sender the transport reports through
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<T>,
        handler: H,
        events: EventSender,
        receiver: EventReceiver,
    ) -> Self {
        let machine = ConnectionStateMachine::new(config);
        let (state_tx, state_rx) = watch::channel(machine.state());
        Self {
            machine,
            transport,
            handler,
            events,
            receiver,
            state_tx,
            state_rx,
        }
    }

    /// Start from a known device instead of locating one
    pub fn with_device(mut self, device: DeviceHandle) -> Self {
        self.machine = self.machine.with_device(device);
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            events: self.events.clone(),
            state: self.state_rx.clone(),
        }
    }

    /// Run the actor on its own task; the task yields the handler when closed
    pub fn spawn(self) -> (ConnectionHandle, JoinHandle<H>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    /// Process events until the link is shut down
    pub async fn run(mut self) -> H {
        info!("Link manager started");

        match self.transport.is_adapter_ready().await {
            Ok(powered) => {
                self.process(Event::Transport(TransportEvent::AdapterStateChanged { powered }))
                    .await
            }
            Err(e) => {
                error!("Could not read adapter state: {}", e);
                self.handler.on_error(&e);
            }
        }

        while self.machine.state() != ConnectionState::Closed {
            match self.receiver.rx.recv().await {
                Some(event) => self.process(event).await,
                None => break,
            }
        }

        info!("Link manager stopped");
        self.handler
    }

    async fn process(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for action in self.machine.handle(event) {
                if let Some(follow_up) = self.execute(action).await {
                    queue.push_back(follow_up);
                }
            }
        }
        self.state_tx.send_replace(self.machine.state());
    }

    /// Run one action; a request that fails to issue comes back as its failure event
    async fn execute(&mut self, action: Action) -> Option<Event> {
        match action {
            Action::Locate { service } => Some(Event::LocateResult(
                self.transport.find_connected_devices(service).await,
            )),
            Action::ScheduleLocateRetry { after, token } => {
                self.schedule(after, Event::LocateRetry { token });
                None
            }
            Action::ScheduleReconnect { after, token } => {
                self.schedule(after, Event::ReconnectDue { token });
                None
            }
            Action::Connect(device) => {
                info!("Connecting to {}", device);
                let result = self.transport.connect(&device).await;
                result.err().map(|e| {
                    Event::Transport(TransportEvent::ConnectFailed {
                        device,
                        error: Some(e.to_string()),
                    })
                })
            }
            Action::DiscoverService { device, service } => {
                let result = self.transport.discover_service(&device, service).await;
                result.err().map(|e| {
                    Event::Transport(TransportEvent::ServiceDiscovered {
                        device,
                        known_characteristics: Vec::new(),
                        error: Some(e.to_string()),
                    })
                })
            }
            Action::DiscoverCharacteristics {
                device,
                service,
                characteristics,
            } => {
                let result = self
                    .transport
                    .discover_characteristics(&device, service, &characteristics)
                    .await;
                result.err().map(|e| {
                    Event::Transport(TransportEvent::CharacteristicsDiscovered {
                        device,
                        characteristics: Vec::new(),
                        error: Some(e.to_string()),
                    })
                })
            }
            Action::Subscribe {
                device,
                characteristic,
            } => {
                debug!("Subscribing to {}", services::label(&characteristic));
                let result = self.transport.subscribe(&device, characteristic).await;
                result.err().map(|e| {
                    Event::Transport(TransportEvent::NotificationStateChanged {
                        device,
                        characteristic,
                        is_notifying: false,
                        error: Some(e.to_string()),
                    })
                })
            }
            Action::Disconnect(device) => {
                info!("Disconnecting from {}", device);
                if let Err(e) = self.transport.disconnect(&device).await {
                    warn!("Disconnect from {} failed: {}", device, e);
                }
                None
            }
            Action::LinkReady(device) => {
                info!("Link to {} ready", device);
                self.handler.on_link_ready(&device);
                None
            }
            Action::LinkLost => {
                info!("Link lost");
                self.handler.on_link_lost();
                None
            }
            Action::DeliverData { value, received_at } => {
                debug!("Rx {}", hex_dump(&value, 32));
                self.handler.on_data(&value, received_at);
                None
            }
            Action::DeliverHeartbeat { received_at } => {
                debug!("Heartbeat");
                self.handler.on_heartbeat(received_at);
                None
            }
            Action::Report(error) => {
                warn!("{} error: {}", error.kind(), error);
                self.handler.on_error(&error);
                None
            }
            Action::Diagnostic(text) => {
                debug!("{}", text);
                self.handler.on_diagnostic(&text);
                None
            }
        }
    }

    /// Post `event` after `after` without blocking the actor
    fn schedule(&self, after: Duration, event: Event) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if events.post(event).is_err() {
                debug!("Timer fired after link stopped");
            }
        });
    }
}
