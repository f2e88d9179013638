use std::collections::BTreeMap;
use std::time::Duration;

use ble_session_bridge_lib::config::AppConfig;
use ble_session_bridge_lib::core::bluetooth::simulated::{RadioCall, SimulatedRadio};
use ble_session_bridge_lib::core::bluetooth::{uuid_from_short, DeviceId};
use ble_session_bridge_lib::host;
use ble_session_bridge_lib::state::AppState;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::time::{sleep, timeout};

struct Client {
    requests: DuplexStream,
    replies: Lines<BufReader<DuplexStream>>,
}

impl Client {
    async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.requests.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.requests.write_all(line.as_bytes()).await.unwrap();
        self.requests.write_all(b"\n").await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let line = timeout(Duration::from_secs(1), self.replies.next_line())
            .await
            .expect("timed out waiting for the bridge")
            .unwrap()
            .expect("bridge output closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.next().await
    }
}

fn pipes() -> (Client, BufReader<DuplexStream>, DuplexStream) {
    let (requests, bridge_input) = tokio::io::duplex(64 * 1024);
    let (bridge_output, replies) = tokio::io::duplex(64 * 1024);
    let client = Client {
        requests,
        replies: BufReader::new(replies).lines(),
    };
    (client, BufReader::new(bridge_input), bridge_output)
}

#[tokio::test]
async fn commands_round_trip_over_json_lines() {
    let (radio, events) = SimulatedRadio::new();
    let state = AppState::new(radio.clone(), events, AppConfig::default());
    let (mut client, input, output) = pipes();

    let bridge = host::serve(&state, input, output, None);
    let session = async move {
        assert_eq!(
            client
                .call(json!({ "id": 1, "method": "listen", "args": { "name": "connector" } }))
                .await,
            json!({ "id": 1, "result": null })
        );
        assert_eq!(
            client
                .call(json!({ "id": 2, "method": "connect", "args": { "deviceId": "AA:01" } }))
                .await,
            json!({ "id": 2, "result": null })
        );
        assert!(radio.calls().contains(&RadioCall::Open {
            device_id: DeviceId::new("AA:01"),
            auto_connect: false,
        }));

        radio.link_up(&DeviceId::new("AA:01"));
        assert_eq!(
            client.next().await,
            json!({
                "channel": "connector",
                "event": { "deviceId": "AA:01", "ConnectionState": "connected" },
            })
        );

        let reply = client
            .call(json!({ "id": 3, "method": "disconnect", "args": { "deviceId": "BB:02" } }))
            .await;
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], "UnknownDevice");

        let reply = client
            .call(json!({
                "id": 4,
                "method": "requestMtu",
                "args": { "deviceId": "AA:01", "expectedMtu": 10 },
            }))
            .await;
        assert_eq!(reply["error"]["code"], "InvalidArgument");

        let reply = client.call(json!({ "id": 5, "method": "bondDevice" })).await;
        assert_eq!(reply["error"]["code"], "NotImplemented");

        client.send_raw("this is not json").await;
        let reply = client.next().await;
        assert_eq!(reply["id"], Value::Null);
        assert_eq!(reply["error"]["code"], "InvalidArgument");

        assert_eq!(
            client
                .call(json!({ "id": 6, "method": "isBluetoothAvailable" }))
                .await,
            json!({ "id": 6, "result": true })
        );

        // Closing the input shuts the bridge down without further events.
        drop(client.requests);
        assert_eq!(client.replies.next_line().await.unwrap(), None);
    };

    let (served, ()) = tokio::join!(bridge, session);
    served.unwrap();
    assert!(state.bluetooth_manager.active_devices().is_empty());
}

#[tokio::test]
async fn scan_results_follow_listen_and_cancel() {
    let (radio, events) = SimulatedRadio::new();
    let state = AppState::new(radio.clone(), events, AppConfig::default());
    let (mut client, input, output) = pipes();

    let bridge = host::serve(&state, input, output, None);
    let session = async move {
        let reply = client
            .call(json!({ "id": 1, "method": "listen", "args": { "name": "advertisements" } }))
            .await;
        assert_eq!(reply["error"]["code"], "InvalidArgument");

        client
            .call(json!({ "id": 2, "method": "listen", "args": { "name": "scanResult" } }))
            .await;
        client
            .call(json!({
                "id": 3,
                "method": "startScan",
                "args": { "filterServiceUUID": "180D" },
            }))
            .await;
        assert!(radio.calls().contains(&RadioCall::StartScan {
            filter: Some(uuid_from_short(0x180d)),
            mode: Default::default(),
        }));

        let mut manufacturer = BTreeMap::new();
        manufacturer.insert(0x004c, vec![0x02, 0x15]);
        radio.advertise(
            &DeviceId::new("strap"),
            None,
            vec![uuid_from_short(0x180d)],
            manufacturer,
            -58,
        );
        assert_eq!(
            client.next().await,
            json!({
                "channel": "scanResult",
                "event": {
                    "name": "",
                    "deviceId": "strap",
                    "manufacturerDataHead": [0x4c, 0x00, 0x02, 0x15],
                    "allManufacturerDataHead": { "76": [2, 21] },
                    "rssi": -58,
                },
            })
        );

        assert_eq!(
            client
                .call(json!({ "id": 4, "method": "cancel", "args": { "name": "scanResult" } }))
                .await,
            json!({ "id": 4, "result": null })
        );
        radio.advertise(
            &DeviceId::new("strap"),
            None,
            vec![uuid_from_short(0x180d)],
            BTreeMap::new(),
            -60,
        );
        sleep(Duration::from_millis(50)).await;

        assert_eq!(
            client.call(json!({ "id": 5, "method": "stopScan" })).await,
            json!({ "id": 5, "result": null })
        );
        drop(client.requests);
        assert_eq!(client.replies.next_line().await.unwrap(), None);
    };

    let (served, ()) = tokio::join!(bridge, session);
    served.unwrap();
}
