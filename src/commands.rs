//! Host commands
//! This module defines all the commands that can be invoked by the host and
//! dispatches them onto the bluetooth manager.

use log::debug;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::connection_config::ConnectionConfig;
use crate::core::bluetooth::{
    parse_uuid, BleError, BluetoothManager, DeviceId, NotifyMode, RadioStack, WriteMode,
    MAX_ATT_MTU, MIN_ATT_MTU,
};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Ble(#[from] BleError),

    #[error("Invalid argument `{field}`: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("Method not implemented: {0}")]
    NotImplemented(String),
}

impl CommandError {
    fn invalid(field: &'static str, reason: impl ToString) -> Self {
        Self::InvalidArgument {
            field,
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable name reported to the host
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ble(e) => e.code(),
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::NotImplemented(_) => "NotImplemented",
        }
    }
}

/// A validated host command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    IsBluetoothAvailable,
    StartScan {
        filter: Option<Uuid>,
    },
    StopScan,
    Connect {
        device_id: DeviceId,
        /// Falls back to the configured default when absent
        auto_connect: Option<bool>,
    },
    Disconnect {
        device_id: DeviceId,
    },
    DiscoverServices {
        device_id: DeviceId,
    },
    SetNotifiable {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        mode: NotifyMode,
    },
    RequestMtu {
        device_id: DeviceId,
        mtu: u16,
    },
    ReadValue {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
    },
    WriteValue {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        mode: WriteMode,
    },
}

#[derive(Deserialize)]
struct StartScanArgs {
    #[serde(rename = "filterServiceUUID")]
    filter_service_uuid: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceArgs {
    device_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectArgs {
    device_id: String,
    auto_connect: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CharacteristicArgs {
    device_id: String,
    service: String,
    characteristic: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetNotifiableArgs {
    device_id: String,
    service: String,
    characteristic: String,
    #[serde(alias = "bleInputProperty")]
    mode: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestMtuArgs {
    device_id: String,
    expected_mtu: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteValueArgs {
    device_id: String,
    service: String,
    characteristic: String,
    value: Vec<u8>,
    #[serde(alias = "bleOutputProperty")]
    mode: String,
}

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, CommandError> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| CommandError::invalid("args", e))
}

fn device_id(raw: &str) -> Result<DeviceId, CommandError> {
    DeviceId::parse(raw).ok_or_else(|| CommandError::invalid("deviceId", "must not be empty"))
}

fn uuid(field: &'static str, raw: &str) -> Result<Uuid, CommandError> {
    parse_uuid(raw).map_err(|e| CommandError::invalid(field, e))
}

fn mtu(expected: i64) -> Result<u16, CommandError> {
    u16::try_from(expected)
        .ok()
        .filter(|mtu| (MIN_ATT_MTU..=MAX_ATT_MTU).contains(mtu))
        .ok_or_else(|| {
            CommandError::invalid(
                "expectedMtu",
                format!("{} is outside {}..={}", expected, MIN_ATT_MTU, MAX_ATT_MTU),
            )
        })
}

impl Command {
    /// Parses a host call into a command, validating every argument.
    pub fn from_call(method: &str, args: Value) -> Result<Self, CommandError> {
        let command = match method {
            "isBluetoothAvailable" => Self::IsBluetoothAvailable,
            "startScan" => {
                let args: StartScanArgs = parse_args(args)?;
                let filter = match args.filter_service_uuid.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(raw) => Some(uuid("filterServiceUUID", raw)?),
                };
                Self::StartScan { filter }
            }
            "stopScan" => Self::StopScan,
            "connect" => {
                let args: ConnectArgs = parse_args(args)?;
                Self::Connect {
                    device_id: device_id(&args.device_id)?,
                    auto_connect: args.auto_connect,
                }
            }
            "disconnect" => {
                let args: DeviceArgs = parse_args(args)?;
                Self::Disconnect {
                    device_id: device_id(&args.device_id)?,
                }
            }
            "discoverServices" => {
                let args: DeviceArgs = parse_args(args)?;
                Self::DiscoverServices {
                    device_id: device_id(&args.device_id)?,
                }
            }
            "setNotifiable" => {
                let args: SetNotifiableArgs = parse_args(args)?;
                Self::SetNotifiable {
                    device_id: device_id(&args.device_id)?,
                    service: uuid("service", &args.service)?,
                    characteristic: uuid("characteristic", &args.characteristic)?,
                    mode: NotifyMode::from_label(&args.mode),
                }
            }
            "requestMtu" => {
                let args: RequestMtuArgs = parse_args(args)?;
                Self::RequestMtu {
                    device_id: device_id(&args.device_id)?,
                    mtu: mtu(args.expected_mtu)?,
                }
            }
            "readValue" => {
                let args: CharacteristicArgs = parse_args(args)?;
                Self::ReadValue {
                    device_id: device_id(&args.device_id)?,
                    service: uuid("service", &args.service)?,
                    characteristic: uuid("characteristic", &args.characteristic)?,
                }
            }
            "writeValue" => {
                let args: WriteValueArgs = parse_args(args)?;
                Self::WriteValue {
                    device_id: device_id(&args.device_id)?,
                    service: uuid("service", &args.service)?,
                    characteristic: uuid("characteristic", &args.characteristic)?,
                    value: args.value,
                    mode: WriteMode::from_label(&args.mode),
                }
            }
            other => return Err(CommandError::NotImplemented(other.to_string())),
        };
        Ok(command)
    }
}

/// Runs a command against the manager.
///
/// # Returns
/// `true`/`false` for `isBluetoothAvailable`, `null` for everything else.
/// Results of radio requests arrive later on the connector channel.
pub async fn dispatch<R: RadioStack>(
    manager: &BluetoothManager<R>,
    command: Command,
    config: &ConnectionConfig,
) -> Result<Value, CommandError> {
    debug!("Dispatching {:?}", command);
    match command {
        Command::IsBluetoothAvailable => {
            return Ok(Value::Bool(manager.is_bluetooth_available().await));
        }
        Command::StartScan { filter } => manager.start_scan(filter).await?,
        Command::StopScan => manager.stop_scan().await?,
        Command::Connect {
            device_id,
            auto_connect,
        } => {
            let auto_connect = auto_connect.unwrap_or(config.default_auto_connect);
            manager.connect(&device_id, auto_connect).await?
        }
        Command::Disconnect { device_id } => manager.disconnect(&device_id).await?,
        Command::DiscoverServices { device_id } => manager.discover_services(&device_id).await?,
        Command::SetNotifiable {
            device_id,
            service,
            characteristic,
            mode,
        } => {
            manager
                .set_notifiable(&device_id, service, characteristic, mode)
                .await?
        }
        Command::RequestMtu { device_id, mtu } => manager.request_mtu(&device_id, mtu).await?,
        Command::ReadValue {
            device_id,
            service,
            characteristic,
        } => manager.read_value(&device_id, service, characteristic).await?,
        Command::WriteValue {
            device_id,
            service,
            characteristic,
            value,
            mode,
        } => {
            manager
                .write_value(&device_id, service, characteristic, &value, mode)
                .await?
        }
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::uuid_from_short;
    use serde_json::json;

    #[test]
    fn scan_filter_accepts_short_and_blank_uuids() {
        assert_eq!(
            Command::from_call("startScan", json!({ "filterServiceUUID": "180D" })).unwrap(),
            Command::StartScan {
                filter: Some(uuid_from_short(0x180d))
            }
        );
        assert_eq!(
            Command::from_call("startScan", json!({ "filterServiceUUID": "" })).unwrap(),
            Command::StartScan { filter: None }
        );
        assert_eq!(
            Command::from_call("startScan", Value::Null).unwrap(),
            Command::StartScan { filter: None }
        );
    }

    #[test]
    fn connect_keeps_missing_auto_connect_open() {
        let command =
            Command::from_call("connect", json!({ "deviceId": " AA:BB:CC:DD:EE:FF " })).unwrap();
        assert_eq!(
            command,
            Command::Connect {
                device_id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
                auto_connect: None,
            }
        );
    }

    #[test]
    fn blank_device_id_is_invalid() {
        let err = Command::from_call("disconnect", json!({ "deviceId": "  " })).unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidArgument {
                field: "deviceId",
                ..
            }
        ));
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn missing_fields_are_invalid() {
        let err = Command::from_call("readValue", json!({ "deviceId": "A" })).unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument { field: "args", .. }));
    }

    #[test]
    fn bad_uuid_names_its_field() {
        let err = Command::from_call(
            "readValue",
            json!({ "deviceId": "A", "service": "180D", "characteristic": "not-a-uuid" }),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CommandError::InvalidArgument {
                field: "characteristic",
                ..
            }
        ));
    }

    #[test]
    fn set_notifiable_accepts_legacy_property_name() {
        let command = Command::from_call(
            "setNotifiable",
            json!({
                "deviceId": "A",
                "service": "180D",
                "characteristic": "2A37",
                "bleInputProperty": "indication",
            }),
        )
        .unwrap();
        assert_eq!(
            command,
            Command::SetNotifiable {
                device_id: DeviceId::new("A"),
                service: uuid_from_short(0x180d),
                characteristic: uuid_from_short(0x2a37),
                mode: NotifyMode::Indication,
            }
        );

        let unknown = Command::from_call(
            "setNotifiable",
            json!({ "deviceId": "A", "service": "180D", "characteristic": "2A37", "mode": "loud" }),
        )
        .unwrap();
        assert!(matches!(unknown, Command::SetNotifiable { mode: NotifyMode::Off, .. }));
    }

    #[test]
    fn mtu_must_be_in_att_range() {
        for expected in [22, 518, -1, 70_000] {
            let err = Command::from_call(
                "requestMtu",
                json!({ "deviceId": "A", "expectedMtu": expected }),
            )
            .unwrap_err();
            assert!(matches!(
                err,
                CommandError::InvalidArgument {
                    field: "expectedMtu",
                    ..
                }
            ));
        }
        assert_eq!(
            Command::from_call("requestMtu", json!({ "deviceId": "A", "expectedMtu": 517 }))
                .unwrap(),
            Command::RequestMtu {
                device_id: DeviceId::new("A"),
                mtu: 517
            }
        );
    }

    #[test]
    fn write_value_selects_write_type() {
        let command = Command::from_call(
            "writeValue",
            json!({
                "deviceId": "A",
                "service": "180D",
                "characteristic": "2A39",
                "value": [1, 2, 255],
                "bleOutputProperty": "withResponse",
            }),
        )
        .unwrap();
        assert!(matches!(
            command,
            Command::WriteValue {
                mode: WriteMode::WithResponse,
                ref value,
                ..
            } if value == &vec![1, 2, 255]
        ));

        let err = Command::from_call(
            "writeValue",
            json!({
                "deviceId": "A",
                "service": "180D",
                "characteristic": "2A39",
                "value": [256],
                "mode": "x",
            }),
        )
        .unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let err = Command::from_call("bondDevice", Value::Null).unwrap_err();
        assert_eq!(err.code(), "NotImplemented");
    }

    #[test]
    fn ble_errors_keep_their_code() {
        let err = CommandError::from(BleError::UnknownDevice(DeviceId::new("A")));
        assert_eq!(err.code(), "UnknownDevice");
        assert_eq!(err.to_string(), "Unknown deviceId: A");
    }
}
