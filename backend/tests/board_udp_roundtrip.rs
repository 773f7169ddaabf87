//! End-to-end board I/O: a fake UDP "firmware" endpoint answers the
//! scheduler's polls and the board mirror tracks what it reports.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use stand_backend::board::Board;
use stand_backend::config::StateDefaults;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn state_defaults() -> StateDefaults {
    serde_json::from_value(json!({
        "pts": {"channel": 0, "value": 0.0, "gain": 1.0, "offset": 0.0},
        "servos": {"channel": 0, "armed": false, "angle": 0.0, "powered": false}
    }))
    .expect("defaults")
}

/// Sensing firmware: echoes `send_id` with a fixed chamber pressure.
async fn fake_sensing_firmware(socket: UdpSocket) {
    let mut buf = vec![0u8; 8192];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(frame) = serde_json::from_slice::<Value>(&buf[..len]) else {
            continue;
        };
        let Some(send_id) = frame.get("send_id").and_then(Value::as_u64) else {
            continue;
        };
        // The query must list the configured channel.
        assert_eq!(frame["pts"]["chamber"]["channel"], 0);
        let response = json!({
            "send_id": send_id,
            "pts": {"chamber": {"value": 101.25}}
        });
        let _ = socket.send_to(response.to_string().as_bytes(), src).await;
    }
}

/// Actuator firmware: acks the desired-state write by reporting it back as
/// actual state.
async fn fake_actuator_firmware(socket: UdpSocket) {
    let mut buf = vec![0u8; 8192];
    loop {
        let Ok((len, src)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(frame) = serde_json::from_slice::<Value>(&buf[..len]) else {
            continue;
        };
        let Some(send_id) = frame.get("send_id").and_then(Value::as_u64) else {
            continue;
        };
        assert_eq!(frame["timestamp"], 0);
        let mut response = json!({"send_id": send_id});
        if let Some(servos) = frame.get("servos") {
            response["servos"] = servos.clone();
        }
        let _ = socket.send_to(response.to_string().as_bytes(), src).await;
    }
}

#[tokio::test]
async fn sensor_polls_mirror_firmware_telemetry() {
    let firmware = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let port = firmware.local_addr().expect("addr").port();
    tokio::spawn(fake_sensing_firmware(firmware));

    let board_config = serde_json::from_value(json!({
        "udp": {"ip": "127.0.0.1", "port": port},
        "polling_interval": 0.05,
        "pts": {"chamber": {"channel": 0}}
    }))
    .expect("board config");
    let board = Board::initialise("sensing", board_config, &state_defaults())
        .await
        .expect("board init");

    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if board.state().await.pts["chamber"].value == 101.25 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "telemetry never landed in the mirror"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    board.shutdown().await;
    board.shutdown().await; // idempotent
}

#[tokio::test]
async fn actuator_writes_round_trip_into_actual_state() {
    let firmware = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let port = firmware.local_addr().expect("addr").port();
    tokio::spawn(fake_actuator_firmware(firmware));

    let board_config = serde_json::from_value(json!({
        "udp": {"ip": "127.0.0.1", "port": port},
        "is_actuator": true,
        "polling_interval": 0.05,
        "servos": {"main": {"channel": 2, "safe_angle": 45.0}}
    }))
    .expect("board config");
    let board = Board::initialise("engine", board_config, &state_defaults())
        .await
        .expect("board init");

    // The firmware acks every desired-state write as actual state, so the
    // safe-angle arming flows back into the mirror.
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let state = board.state().await;
        if state.servos["main"].armed && state.servos["main"].angle == 45.0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "actuator ack never landed in the mirror"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // With the actual state now armed, a commanded angle passes the
    // firewall and the next write carries it to the firmware.
    board
        .update_desired_state(
            &serde_json::from_value(json!({"servos": {"main": {"angle": 60.0, "powered": true}}}))
                .expect("update"),
        )
        .await;

    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        if board.state().await.servos["main"].angle == 60.0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "commanded angle never came back as telemetry"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    board.shutdown().await;
}
