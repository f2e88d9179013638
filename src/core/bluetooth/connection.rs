//! Per-device connection session
//! A session follows `Connecting → Connected → Disconnecting → Disconnected`.
//! It turns radio callbacks into host messages; the manager performs the
//! platform calls and owns the session's lifetime.

use std::collections::HashMap;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::core::bluetooth::constants::UUID_CLIENT_CHARACTERISTIC_CONFIG;
use crate::core::bluetooth::error::BleError;
use crate::core::bluetooth::notification::NotifyMode;
use crate::core::bluetooth::radio::GattEvent;
use crate::core::bluetooth::types::{
    ConnectionState, DeviceId, GattCharacteristic, GattService, GattStatus, LinkState,
    ServiceDescriptor,
};
use crate::core::events::BleMessage;

/// Why a session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// The radio reported anything but a successful connection
    LinkLost,
    /// The host called `disconnect`
    UserRequest,
    /// The adapter is turning off
    PowerOff,
    /// The manager is shutting down
    Shutdown,
}

/// Messages to emit after handling a callback, and whether the link is gone
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub messages: Vec<BleMessage>,
    pub teardown: bool,
}

impl SessionOutcome {
    fn emit(message: BleMessage) -> Self {
        Self {
            messages: vec![message],
            teardown: false,
        }
    }

    fn teardown() -> Self {
        Self {
            messages: Vec::new(),
            teardown: true,
        }
    }
}

/// Connection state machine of one remote device
#[derive(Debug)]
pub struct ConnectionSession {
    device_id: DeviceId,
    state: ConnectionState,
    reported_connected: bool,
    services: Vec<GattService>,
    negotiated_mtu: Option<u16>,
    subscriptions: HashMap<(Uuid, Uuid), NotifyMode>,
}

impl ConnectionSession {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            state: ConnectionState::Connecting,
            reported_connected: false,
            services: Vec::new(),
            negotiated_mtu: None,
            subscriptions: HashMap::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    pub fn negotiated_mtu(&self) -> Option<u16> {
        self.negotiated_mtu
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.services.iter().map(ServiceDescriptor::from).collect()
    }

    pub fn notify_mode(&self, service: Uuid, characteristic: Uuid) -> NotifyMode {
        self.subscriptions
            .get(&(service, characteristic))
            .copied()
            .unwrap_or_default()
    }

    /// Handles one radio callback. Sessions that are shutting down ignore everything.
    pub fn handle(&mut self, event: GattEvent) -> SessionOutcome {
        if !self.is_open() {
            debug!(
                "Ignoring callback for {} in state {:?}: {:?}",
                self.device_id, self.state, event
            );
            return SessionOutcome::default();
        }

        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state(status, state)
            }
            GattEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services)
            }
            GattEvent::MtuChanged { status, mtu } => self.on_mtu_changed(status, mtu),
            GattEvent::CharacteristicRead {
                status,
                service,
                characteristic,
                value,
            } => {
                if status.is_success() {
                    SessionOutcome::emit(BleMessage::characteristic_value(
                        self.device_id.clone(),
                        service,
                        characteristic,
                        value,
                    ))
                } else {
                    warn!(
                        "Read of {} on {} failed with {:?}",
                        characteristic, self.device_id, status
                    );
                    SessionOutcome::default()
                }
            }
            GattEvent::CharacteristicWrite {
                status,
                service,
                characteristic,
            } => SessionOutcome::emit(BleMessage::write_result(
                self.device_id.clone(),
                service,
                characteristic,
                status.is_success(),
            )),
            GattEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            } => SessionOutcome::emit(BleMessage::characteristic_value(
                self.device_id.clone(),
                service,
                characteristic,
                value,
            )),
        }
    }

    fn on_connection_state(&mut self, status: GattStatus, link: LinkState) -> SessionOutcome {
        debug!(
            "Connection callback for {}: status {:?}, link {:?}",
            self.device_id, status, link
        );
        if status.is_success() && link == LinkState::Connected {
            if self.state == ConnectionState::Connected {
                debug!("{} reported connected twice, ignoring", self.device_id);
                return SessionOutcome::default();
            }
            self.state = ConnectionState::Connected;
            self.reported_connected = true;
            info!("Device {} connected", self.device_id);
            SessionOutcome::emit(BleMessage::connected(self.device_id.clone()))
        } else {
            SessionOutcome::teardown()
        }
    }

    fn on_services_discovered(
        &mut self,
        status: GattStatus,
        services: Vec<GattService>,
    ) -> SessionOutcome {
        if !status.is_success() {
            warn!(
                "Service discovery on {} failed with {:?}",
                self.device_id, status
            );
            return SessionOutcome::default();
        }

        for service in &services {
            debug!("Service {}", service.uuid);
            for characteristic in &service.characteristics {
                debug!("    Characteristic {}", characteristic.uuid);
                for descriptor in &characteristic.descriptors {
                    debug!("        Descriptor {}", descriptor);
                }
            }
        }
        info!(
            "Discovered {} services on {}",
            services.len(),
            self.device_id
        );

        self.services = services;
        let messages = self
            .services
            .iter()
            .map(|service| {
                BleMessage::service_discovered(
                    self.device_id.clone(),
                    ServiceDescriptor::from(service),
                )
            })
            .collect();
        SessionOutcome {
            messages,
            teardown: false,
        }
    }

    fn on_mtu_changed(&mut self, status: GattStatus, mtu: u16) -> SessionOutcome {
        if !status.is_success() {
            warn!("MTU change on {} failed with {:?}", self.device_id, status);
            return SessionOutcome::default();
        }
        info!("Negotiated MTU {} on {}", mtu, self.device_id);
        self.negotiated_mtu = Some(mtu);
        SessionOutcome::emit(BleMessage::mtu_config(self.device_id.clone(), mtu))
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristic(characteristic))
    }

    fn unavailable(&self, service: Uuid, characteristic: Uuid) -> BleError {
        BleError::CharacteristicUnavailable {
            device_id: self.device_id.clone(),
            service,
            characteristic,
        }
    }

    /// Checks that discovery found `characteristic` inside `service`.
    pub fn ensure_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        match self.characteristic(service, characteristic) {
            Some(_) => Ok(()),
            None => Err(self.unavailable(service, characteristic)),
        }
    }

    /// Like [`Self::ensure_characteristic`], additionally requiring a client
    /// configuration descriptor.
    pub fn ensure_notifiable(&self, service: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        match self.characteristic(service, characteristic) {
            Some(c) if c.has_descriptor(UUID_CLIENT_CHARACTERISTIC_CONFIG) => Ok(()),
            _ => Err(self.unavailable(service, characteristic)),
        }
    }

    pub fn record_subscription(&mut self, service: Uuid, characteristic: Uuid, mode: NotifyMode) {
        if mode.delivers() {
            self.subscriptions.insert((service, characteristic), mode);
        } else {
            self.subscriptions.remove(&(service, characteristic));
        }
    }

    /// Claims the teardown. Returns `None` if it is already underway, otherwise
    /// whether a disconnected message must follow.
    pub fn begin_teardown(&mut self, cause: TeardownCause) -> Option<bool> {
        if !self.is_open() {
            return None;
        }
        self.state = ConnectionState::Disconnecting;
        let notify = match cause {
            TeardownCause::LinkLost | TeardownCause::PowerOff => true,
            // A disconnect issued before the link came up has no terminal event.
            TeardownCause::UserRequest => self.reported_connected,
            TeardownCause::Shutdown => false,
        };
        Some(notify)
    }

    pub fn finish_teardown(&mut self, notify: bool) -> Option<BleMessage> {
        if self.state == ConnectionState::Disconnected {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        self.services.clear();
        self.subscriptions.clear();
        info!("Device {} disconnected", self.device_id);
        notify.then(|| BleMessage::disconnected(self.device_id.clone()))
    }

    /// Marks a session whose connection never got opened.
    pub fn abandon(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::types::uuid_from_short;

    fn session() -> ConnectionSession {
        ConnectionSession::new(DeviceId::new("AA:BB:CC:DD:EE:FF"))
    }

    fn connected_session() -> ConnectionSession {
        let mut session = session();
        session.handle(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        });
        session
    }

    fn heart_rate_topology() -> Vec<GattService> {
        vec![
            GattService::new(
                uuid_from_short(0x180d),
                vec![
                    GattCharacteristic::new(
                        uuid_from_short(0x2a37),
                        vec![UUID_CLIENT_CHARACTERISTIC_CONFIG],
                    ),
                    GattCharacteristic::new(uuid_from_short(0x2a38), vec![]),
                ],
            ),
            GattService::new(
                uuid_from_short(0x180f),
                vec![GattCharacteristic::new(uuid_from_short(0x2a19), vec![])],
            ),
        ]
    }

    #[test]
    fn successful_link_reports_connected_once() {
        let mut session = session();
        let outcome = session.handle(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        });
        assert_eq!(
            outcome.messages,
            vec![BleMessage::connected(session.device_id().clone())]
        );
        assert_eq!(session.state(), ConnectionState::Connected);

        let repeated = session.handle(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        });
        assert_eq!(repeated, SessionOutcome::default());
    }

    #[test]
    fn any_other_link_callback_requests_teardown() {
        for (status, state) in [
            (GattStatus::Failure(133), LinkState::Connected),
            (GattStatus::Success, LinkState::Disconnected),
            (GattStatus::Failure(8), LinkState::Disconnected),
        ] {
            let mut connecting = session();
            assert!(
                connecting
                    .handle(GattEvent::ConnectionStateChanged { status, state })
                    .teardown
            );

            let mut connected = connected_session();
            assert!(connected.handle(GattEvent::ConnectionStateChanged { status, state }).teardown);
        }
    }

    #[test]
    fn discovery_emits_one_message_per_service() {
        let mut session = connected_session();
        let outcome = session.handle(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: heart_rate_topology(),
        });

        let id = session.device_id().clone();
        assert_eq!(
            outcome.messages,
            vec![
                BleMessage::service_discovered(
                    id.clone(),
                    ServiceDescriptor {
                        service: uuid_from_short(0x180d),
                        characteristics: vec![uuid_from_short(0x2a37), uuid_from_short(0x2a38)],
                    }
                ),
                BleMessage::service_discovered(
                    id,
                    ServiceDescriptor {
                        service: uuid_from_short(0x180f),
                        characteristics: vec![uuid_from_short(0x2a19)],
                    }
                ),
            ]
        );
        assert_eq!(session.services().len(), 2);
    }

    #[test]
    fn failed_discovery_is_silent() {
        let mut session = connected_session();
        let outcome = session.handle(GattEvent::ServicesDiscovered {
            status: GattStatus::Failure(129),
            services: heart_rate_topology(),
        });
        assert_eq!(outcome, SessionOutcome::default());
        assert!(session.services().is_empty());
    }

    #[test]
    fn characteristics_resolve_only_after_discovery() {
        let mut session = connected_session();
        let service = uuid_from_short(0x180d);
        let measurement = uuid_from_short(0x2a37);
        assert!(matches!(
            session.ensure_characteristic(service, measurement),
            Err(BleError::CharacteristicUnavailable { .. })
        ));

        session.handle(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: heart_rate_topology(),
        });
        assert!(session.ensure_characteristic(service, measurement).is_ok());
        assert!(session.ensure_notifiable(service, measurement).is_ok());
        // Body sensor location has no client configuration descriptor.
        assert!(session.ensure_notifiable(service, uuid_from_short(0x2a38)).is_err());
        // Battery level lives in another service.
        assert!(session.ensure_characteristic(service, uuid_from_short(0x2a19)).is_err());
    }

    #[test]
    fn mtu_is_recorded_on_success_only() {
        let mut session = connected_session();
        assert!(session
            .handle(GattEvent::MtuChanged {
                status: GattStatus::Failure(1),
                mtu: 247,
            })
            .messages
            .is_empty());
        assert_eq!(session.negotiated_mtu(), None);

        let outcome = session.handle(GattEvent::MtuChanged {
            status: GattStatus::Success,
            mtu: 247,
        });
        assert_eq!(
            outcome.messages,
            vec![BleMessage::mtu_config(session.device_id().clone(), 247)]
        );
        assert_eq!(session.negotiated_mtu(), Some(247));
    }

    #[test]
    fn reads_and_notifications_share_one_message_shape() {
        let mut session = connected_session();
        let service = uuid_from_short(0x180d);
        let characteristic = uuid_from_short(0x2a37);

        let read = session.handle(GattEvent::CharacteristicRead {
            status: GattStatus::Success,
            service,
            characteristic,
            value: vec![0x00, 0x48],
        });
        let notified = session.handle(GattEvent::CharacteristicChanged {
            service,
            characteristic,
            value: vec![0x00, 0x48],
        });
        assert_eq!(read, notified);

        let failed_read = session.handle(GattEvent::CharacteristicRead {
            status: GattStatus::Failure(2),
            service,
            characteristic,
            value: vec![],
        });
        assert!(failed_read.messages.is_empty());
    }

    #[test]
    fn teardown_is_claimed_once() {
        let mut session = connected_session();
        assert_eq!(session.begin_teardown(TeardownCause::LinkLost), Some(true));
        assert_eq!(session.begin_teardown(TeardownCause::PowerOff), None);
        assert_eq!(session.state(), ConnectionState::Disconnecting);

        // Callbacks racing the teardown are ignored.
        let late = session.handle(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        });
        assert_eq!(late, SessionOutcome::default());

        assert_eq!(
            session.finish_teardown(true),
            Some(BleMessage::disconnected(session.device_id().clone()))
        );
        assert_eq!(session.finish_teardown(true), None);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn user_disconnect_before_link_has_no_terminal_message() {
        let mut connecting = session();
        assert_eq!(connecting.begin_teardown(TeardownCause::UserRequest), Some(false));
        assert_eq!(connecting.finish_teardown(false), None);

        let mut connected = connected_session();
        assert_eq!(connected.begin_teardown(TeardownCause::UserRequest), Some(true));
    }

    #[test]
    fn subscriptions_follow_recorded_mode() {
        let mut session = connected_session();
        let service = uuid_from_short(0x180d);
        let characteristic = uuid_from_short(0x2a37);
        session.record_subscription(service, characteristic, NotifyMode::Indication);
        assert_eq!(session.notify_mode(service, characteristic), NotifyMode::Indication);
        session.record_subscription(service, characteristic, NotifyMode::Off);
        assert_eq!(session.notify_mode(service, characteristic), NotifyMode::Off);
    }
}
