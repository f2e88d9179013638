//! Bluetooth manager for the session bridge
//! This module owns the active connection sessions, routes radio callbacks to
//! them and exposes the operations the command surface dispatches to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::bluetooth::connection::{ConnectionSession, TeardownCause};
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::{apply_notify_mode, NotifyMode};
use crate::core::bluetooth::radio::{GattEvent, RadioEvent, RadioEventReceiver, RadioStack};
use crate::core::bluetooth::registry::DeviceRegistry;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{ConnectionState, DeviceId, ServiceDescriptor, WriteMode};
use crate::core::events::{EventEmitter, Messages, ScanResults};

type SharedSession = Arc<Mutex<ConnectionSession>>;

struct SessionEntry {
    generation: u64,
    session: SharedSession,
    inbox: mpsc::UnboundedSender<GattEvent>,
}

struct Shared<R: RadioStack> {
    radio: Arc<R>,
    devices: DeviceRegistry<R::Device>,
    sessions: Mutex<HashMap<DeviceId, SessionEntry>>,
    scanner: BluetoothScanner<R>,
    emitter: EventEmitter,
    next_generation: AtomicU64,
}

/// Manages scanning and the connection sessions of every remote device
pub struct BluetoothManager<R: RadioStack> {
    shared: Arc<Shared<R>>,
    cancel_token: CancellationToken,
    router_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RadioStack> BluetoothManager<R> {
    /// Creates the manager and subscribes to the radio's callbacks.
    pub fn start(
        radio: Arc<R>,
        radio_events: RadioEventReceiver<R::Device>,
        emitter: EventEmitter,
        config: &AppConfig,
    ) -> Self {
        let devices = DeviceRegistry::new();
        let scanner = BluetoothScanner::new(
            radio.clone(),
            devices.clone(),
            emitter.clone(),
            config.scan.mode,
        );
        let shared = Arc::new(Shared {
            radio,
            devices,
            sessions: Mutex::new(HashMap::new()),
            scanner,
            emitter,
            next_generation: AtomicU64::new(1),
        });

        let cancel_token = CancellationToken::new();
        let router_handle = tokio::spawn(Shared::route_events(
            shared.clone(),
            radio_events,
            cancel_token.clone(),
        ));
        info!("Bluetooth manager started.");

        Self {
            shared,
            cancel_token,
            router_handle: Mutex::new(Some(router_handle)),
        }
    }

    pub async fn is_bluetooth_available(&self) -> bool {
        self.shared.radio.is_available().await
    }

    pub async fn start_scan(&self, filter: Option<Uuid>) -> Result<(), BleError> {
        self.shared.scanner.start_scan(filter).await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.shared.scanner.stop_scan().await
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanner.is_scanning()
    }

    /// Attaches a listener to discovered peripherals.
    pub fn scan_results(&self) -> ScanResults {
        self.shared.scanner.results()
    }

    /// Attaches a listener to session messages.
    pub fn messages(&self) -> Messages {
        self.shared.emitter.listen_messages()
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.shared.emitter
    }

    /// Opens a connection. Returns as soon as the platform accepted the request;
    /// the outcome arrives as a connection state message.
    pub async fn connect(&self, device_id: &DeviceId, auto_connect: bool) -> Result<(), BleError> {
        if self.shared.entry(device_id).is_some() {
            info!("Device {} already has a session.", device_id);
            return Ok(());
        }
        if !self.shared.radio.is_available().await {
            warn!("Cannot connect to {}: bluetooth radio is unavailable", device_id);
            return Err(BleError::RadioUnavailable);
        }

        let reserved = {
            let mut sessions = self.shared.sessions.lock();
            if sessions.contains_key(device_id) {
                None
            } else {
                let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
                let session = Arc::new(Mutex::new(ConnectionSession::new(device_id.clone())));
                let (inbox, inbox_rx) = mpsc::unbounded_channel();
                sessions.insert(
                    device_id.clone(),
                    SessionEntry {
                        generation,
                        session: session.clone(),
                        inbox,
                    },
                );
                Some((generation, session, inbox_rx))
            }
        };
        let Some((generation, session, inbox_rx)) = reserved else {
            info!("Device {} already has a session.", device_id);
            return Ok(());
        };

        tokio::spawn(Shared::run_session(
            self.shared.clone(),
            device_id.clone(),
            generation,
            session,
            inbox_rx,
        ));

        info!("Initiating connection to {} (autoConnect: {})", device_id, auto_connect);
        if let Err(e) = self.open_link(device_id, auto_connect).await {
            warn!("Connection request for {} failed: {}", device_id, e);
            self.shared.withdraw(device_id, generation);
            return Err(e);
        }

        // A teardown that ran while the link was being opened found nothing
        // to release, so the link opened here belongs to no session.
        if self.shared.is_orphaned(device_id, generation) {
            warn!("Session for {} ended while connecting, releasing the link", device_id);
            self.shared.release_link(device_id).await;
        }
        Ok(())
    }

    async fn open_link(&self, device_id: &DeviceId, auto_connect: bool) -> Result<(), BleError> {
        let device = self
            .shared
            .devices
            .resolve(self.shared.radio.as_ref(), device_id)
            .await?;
        self.shared.radio.open(&device, auto_connect).await
    }

    /// Tears the session down. A disconnected message follows only if the
    /// session had reported connected.
    pub async fn disconnect(&self, device_id: &DeviceId) -> Result<(), BleError> {
        let Some((generation, _)) = self.shared.entry(device_id) else {
            return Err(BleError::UnknownDevice(device_id.clone()));
        };
        self.shared
            .teardown(device_id, generation, TeardownCause::UserRequest)
            .await;
        Ok(())
    }

    pub async fn discover_services(&self, device_id: &DeviceId) -> Result<(), BleError> {
        self.shared.open_session(device_id)?;
        debug!("Discovering services on {}", device_id);
        self.shared.radio.discover_services(device_id).await
    }

    pub async fn set_notifiable(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        mode: NotifyMode,
    ) -> Result<(), BleError> {
        let session = self.shared.open_session(device_id)?;
        session.lock().ensure_notifiable(service, characteristic)?;

        apply_notify_mode(
            self.shared.radio.as_ref(),
            device_id,
            service,
            characteristic,
            mode,
        )
        .await?;

        session
            .lock()
            .record_subscription(service, characteristic, mode);
        Ok(())
    }

    pub async fn request_mtu(&self, device_id: &DeviceId, mtu: u16) -> Result<(), BleError> {
        self.shared.open_session(device_id)?;
        debug!("Requesting MTU {} on {}", mtu, device_id);
        self.shared.radio.request_mtu(device_id, mtu).await
    }

    /// Issues a read; the value arrives later as a characteristic value message.
    pub async fn read_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let session = self.shared.open_session(device_id)?;
        session.lock().ensure_characteristic(service, characteristic)?;
        self.shared
            .radio
            .read_characteristic(device_id, service, characteristic)
            .await
    }

    /// Issues a write; acknowledged writes report back with a write result message.
    pub async fn write_value(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        let session = self.shared.open_session(device_id)?;
        session.lock().ensure_characteristic(service, characteristic)?;
        debug!(
            "Writing {} bytes to {} on {} ({:?})",
            value.len(),
            characteristic,
            device_id,
            mode
        );
        self.shared
            .radio
            .write_characteristic(device_id, service, characteristic, value, mode)
            .await
    }

    pub fn connection_state(&self, device_id: &DeviceId) -> Option<ConnectionState> {
        self.shared
            .entry(device_id)
            .map(|(_, session)| session.lock().state())
    }

    pub fn discovered_services(&self, device_id: &DeviceId) -> Option<Vec<ServiceDescriptor>> {
        self.shared
            .entry(device_id)
            .map(|(_, session)| session.lock().services())
    }

    pub fn negotiated_mtu(&self, device_id: &DeviceId) -> Option<u16> {
        self.shared
            .entry(device_id)
            .and_then(|(_, session)| session.lock().negotiated_mtu())
    }

    pub fn notify_mode(
        &self,
        device_id: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<NotifyMode> {
        self.shared
            .entry(device_id)
            .map(|(_, session)| session.lock().notify_mode(service, characteristic))
    }

    /// Identifiers that currently own a session, sorted.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.shared.sessions.lock().keys().cloned().collect();
        devices.sort();
        devices
    }

    pub fn is_device_cached(&self, device_id: &DeviceId) -> bool {
        self.shared.devices.contains(device_id)
    }

    /// Unsubscribes from the radio, stops scanning and releases every session
    /// without emitting further messages.
    pub async fn shutdown(&self) {
        info!("Shutting down bluetooth manager.");
        self.cancel_token.cancel();
        let router_handle = self.router_handle.lock().take();
        if let Some(handle) = router_handle {
            if let Err(e) = handle.await {
                warn!("Radio event router finished with an error: {:?}", e);
            }
        }

        if let Err(e) = self.shared.scanner.stop_scan().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }
        for (device_id, generation) in self.shared.entries() {
            self.shared
                .teardown(&device_id, generation, TeardownCause::Shutdown)
                .await;
        }
    }
}

impl<R: RadioStack> Shared<R> {
    fn entry(&self, device_id: &DeviceId) -> Option<(u64, SharedSession)> {
        self.sessions
            .lock()
            .get(device_id)
            .map(|entry| (entry.generation, entry.session.clone()))
    }

    fn entries(&self) -> Vec<(DeviceId, u64)> {
        self.sessions
            .lock()
            .iter()
            .map(|(device_id, entry)| (device_id.clone(), entry.generation))
            .collect()
    }

    /// The session of `device_id`, provided it still accepts commands.
    fn open_session(&self, device_id: &DeviceId) -> Result<SharedSession, BleError> {
        match self.entry(device_id) {
            Some((_, session)) if session.lock().is_open() => Ok(session),
            _ => Err(BleError::UnknownDevice(device_id.clone())),
        }
    }

    /// Drops a reservation whose connection could not be opened.
    fn withdraw(&self, device_id: &DeviceId, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(device_id).map(|e| e.generation) == Some(generation) {
            if let Some(entry) = sessions.remove(device_id) {
                entry.session.lock().abandon();
            }
        }
    }

    /// True when the session `generation` of `device_id` has been torn down and
    /// no newer session took over the device.
    fn is_orphaned(&self, device_id: &DeviceId, generation: u64) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(device_id) {
            Some(entry) if entry.generation == generation => !entry.session.lock().is_open(),
            Some(_) => false,
            None => true,
        }
    }

    async fn release_link(&self, device_id: &DeviceId) {
        if let Err(e) = self.radio.disconnect(device_id).await {
            warn!("Disconnect of {} failed: {}", device_id, e);
        }
        if let Err(e) = self.radio.close(device_id).await {
            warn!("Closing {} failed: {}", device_id, e);
        }
    }

    /// Releases the platform connection, deregisters the session and emits the
    /// terminal message. Only the first caller for a session does anything.
    async fn teardown(&self, device_id: &DeviceId, generation: u64, cause: TeardownCause) -> bool {
        let session = match self.entry(device_id) {
            Some((current, session)) if current == generation => session,
            _ => return false,
        };
        let claimed = session.lock().begin_teardown(cause);
        let Some(notify) = claimed else {
            debug!("Teardown of {} already underway", device_id);
            return false;
        };

        info!("Tearing down session for {} ({:?})", device_id, cause);
        self.release_link(device_id).await;

        // The terminal message is queued before the registry lock is released,
        // so a fresh session for the same device can only report after it.
        let mut sessions = self.sessions.lock();
        if sessions.get(device_id).map(|e| e.generation) == Some(generation) {
            sessions.remove(device_id);
        }
        if let Some(message) = session.lock().finish_teardown(notify) {
            self.emitter.emit_message(message);
        }
        true
    }

    async fn power_off(&self) {
        info!("Bluetooth adapter powering off, releasing every session.");
        self.devices.clear();
        self.scanner.mark_idle();
        for (device_id, generation) in self.entries() {
            self.teardown(&device_id, generation, TeardownCause::PowerOff)
                .await;
        }
    }

    async fn route(&self, event: RadioEvent<R::Device>) {
        match event {
            RadioEvent::AdapterStateChanged(state) => {
                info!("Bluetooth adapter state changed: {:?}", state);
                if state.is_powering_down() {
                    self.power_off().await;
                }
            }
            RadioEvent::Advertisement(advertisement) => {
                self.scanner.handle_advertisement(advertisement);
            }
            RadioEvent::ScanFailed { code } => self.scanner.handle_scan_failure(code),
            RadioEvent::Gatt { device_id, event } => {
                let inbox = self
                    .sessions
                    .lock()
                    .get(&device_id)
                    .map(|entry| entry.inbox.clone());
                match inbox {
                    Some(inbox) => {
                        if inbox.send(event).is_err() {
                            debug!("Session task for {} already finished", device_id);
                        }
                    }
                    None => debug!(
                        "Dropping callback for {} without an active session: {:?}",
                        device_id, event
                    ),
                }
            }
        }
    }

    async fn route_events(
        self: Arc<Self>,
        mut radio_events: RadioEventReceiver<R::Device>,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for radio callbacks...");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Radio event router cancelled.");
                    break;
                }
                event = radio_events.recv() => {
                    match event {
                        Some(event) => self.route(event).await,
                        None => {
                            info!("Radio event channel has ended.");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Processes the callbacks of one session in arrival order.
    async fn run_session(
        self: Arc<Self>,
        device_id: DeviceId,
        generation: u64,
        session: SharedSession,
        mut inbox: mpsc::UnboundedReceiver<GattEvent>,
    ) {
        debug!("Session task for {} (generation {}) started", device_id, generation);
        while let Some(event) = inbox.recv().await {
            let teardown = {
                let mut session = session.lock();
                let outcome = session.handle(event);
                for message in outcome.messages {
                    self.emitter.emit_message(message);
                }
                outcome.teardown
            };
            if teardown {
                self.teardown(&device_id, generation, TeardownCause::LinkLost)
                    .await;
            }
            if session.lock().state() == ConnectionState::Disconnected {
                break;
            }
        }
        debug!("Session task for {} (generation {}) finished", device_id, generation);
    }
}
