//! main.rs — board firmware emulator
//!
//! Stands in for one microcontroller board on the bench: binds a UDP port,
//! speaks the correlated-frame protocol (echoes `send_id`), answers sensor
//! queries with drifting noisy measurements and acks actuator writes by
//! mirroring the commanded state back as actual state.
//!
//! Point a board's `udp` config at it and the whole backend runs with no
//! hardware on the desk:
//!
//! ```text
//! board-sim --listen 0.0.0.0:8889 --name engine
//! ```

use std::collections::HashMap;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use stand_types::{
    GnssUpdate, ImuUpdate, LoadcellUpdate, PtUpdate, StateUpdate, TcUpdate,
};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "board-sim", about = "Ground control board firmware emulator")]
struct Args {
    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:8889")]
    listen: String,
    /// Board label used in logs
    #[arg(long, default_value = "engine")]
    name: String,
    /// Uniform sensor noise amplitude
    #[arg(long, default_value = "0.25")]
    noise: f64,
    /// Per-sample random-walk drift amplitude
    #[arg(long, default_value = "0.05")]
    drift: f64,
    /// Fraction of responses to silently drop (exercises the backend's
    /// timeout + GC path)
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,
    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

// ── Sensor simulation ─────────────────────────────────────────────────────────

struct SensorSim {
    rng: StdRng,
    noise: f64,
    drift: f64,
    baselines: HashMap<String, f64>,
}

impl SensorSim {
    fn new(noise: f64, drift: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            noise,
            drift,
            baselines: HashMap::new(),
        }
    }

    fn uniform(&mut self, amplitude: f64) -> f64 {
        (self.rng.gen::<f64>() - 0.5) * 2.0 * amplitude
    }

    /// Random-walking baseline plus sample noise, keyed per family+item.
    fn sample(&mut self, family: &str, item: &str) -> f64 {
        let resting = match family {
            "pts" => 14.7,   // ambient psi
            "tcs" => 293.15, // ambient K
            _ => 0.0,
        };
        let key = format!("{family}/{item}");
        let step = self.uniform(self.drift);
        let baseline = self.baselines.entry(key).or_insert(resting);
        *baseline += step;
        *baseline + self.uniform(self.noise)
    }
}

// ── Frame handling ────────────────────────────────────────────────────────────

/// Builds the response for one inbound frame, or `None` when the frame
/// carries no `send_id` (real firmware stays silent too).
fn build_response(frame: &Value, sim: &mut SensorSim) -> Option<Value> {
    let send_id = frame.get("send_id").and_then(Value::as_u64)?;
    // The shared state model parses both query and actuator-write frames;
    // extra keys (send_id, timestamp) fall away here.
    let request: StateUpdate = match serde_json::from_value(frame.clone()) {
        Ok(request) => request,
        Err(e) => {
            warn!("frame {send_id} did not parse as a state update: {e}");
            return None;
        }
    };

    let mut reply = StateUpdate::default();

    // Actuator write: mirror the commanded families back as actual state.
    reply.servos = request.servos.clone();
    reply.solenoids = request.solenoids.clone();
    reply.pyros = request.pyros.clone();

    // Sensor query: answer each listed item with a fresh measurement.
    for (item, query) in &request.pts {
        reply.pts.insert(
            item.clone(),
            PtUpdate {
                channel: query.channel,
                value: Some(sim.sample("pts", item)),
                ..Default::default()
            },
        );
    }
    for (item, query) in &request.tcs {
        reply.tcs.insert(
            item.clone(),
            TcUpdate {
                channel: query.channel,
                value: Some(sim.sample("tcs", item)),
            },
        );
    }
    for (item, query) in &request.loadcells {
        reply.loadcells.insert(
            item.clone(),
            LoadcellUpdate {
                channel: query.channel,
                value: Some(sim.sample("loadcells", item)),
                ..Default::default()
            },
        );
    }

    // IMU/GNSS queries get quiet-pad readings.
    for (item, query) in &request.imus {
        reply.imus.insert(
            item.clone(),
            ImuUpdate {
                channel: query.channel,
                ax: Some(sim.uniform(0.02)),
                ay: Some(sim.uniform(0.02)),
                az: Some(-9.81 + sim.uniform(0.02)),
                gx: Some(sim.uniform(0.01)),
                gy: Some(sim.uniform(0.01)),
                gz: Some(sim.uniform(0.01)),
            },
        );
    }
    for (item, query) in &request.gnss {
        reply.gnss.insert(
            item.clone(),
            GnssUpdate {
                channel: query.channel,
                lat: Some(51.4993 + sim.uniform(1e-6)),
                lon: Some(-0.1752 + sim.uniform(1e-6)),
                alt: Some(32.0 + sim.uniform(0.2)),
            },
        );
    }

    let mut response = match serde_json::to_value(&reply) {
        Ok(response) => response,
        Err(e) => {
            warn!("could not serialize response {send_id}: {e}");
            return None;
        }
    };
    if let Value::Object(map) = &mut response {
        map.insert("send_id".into(), send_id.into());
    }
    Some(response)
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "board_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let socket = UdpSocket::bind(&args.listen).await?;
    info!(
        "🛰  board-sim \"{}\" listening on {} (noise ±{}, drop rate {})",
        args.name, args.listen, args.noise, args.drop_rate
    );

    let mut sim = SensorSim::new(args.noise, args.drift, args.seed);
    let mut buf = vec![0u8; 8192];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("recv error: {e}");
                continue;
            }
        };
        let frame: Value = match serde_json::from_slice(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("malformed frame from {src}: {e}");
                continue;
            }
        };
        let Some(response) = build_response(&frame, &mut sim) else {
            debug!("frame from {src} without send_id ignored");
            continue;
        };
        if sim.rng.gen::<f64>() < args.drop_rate {
            debug!("dropping response {} on purpose", response["send_id"]);
            continue;
        }
        if let Err(e) = socket.send_to(response.to_string().as_bytes(), src).await {
            warn!("send to {src} failed: {e}");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
