//! CSV test logs: one row per sample of every board's actual and desired
//! state.
//!
//! File layout matches the long-standing analysis tooling: a leading `#`
//! comment row with the start timestamp and ADC calibration metadata, then a
//! header row with one `board_hwtype_item_field` column per actual-state
//! field (desired-state columns carry a `_desiredstate` suffix), then data
//! rows keyed by seconds since the log opened. Rows are flushed as they are
//! written so a hard stop loses at most one sample.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use stand_types::HardwareType;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::hardware::HardwareHandler;

struct Column {
    board: String,
    family: HardwareType,
    item: String,
    field: String,
    desired: bool,
}

pub struct BoardStateLogger {
    file_name: String,
    writer: csv::Writer<std::fs::File>,
    columns: Vec<Column>,
    start: Instant,
}

impl BoardStateLogger {
    /// Opens `<log_dir>/test_<stamp>_<name>.csv`, writes the calibration
    /// comment and the header row for the boards currently loaded.
    pub async fn create(
        name: &str,
        hardware: &HardwareHandler,
        log_dir: &Path,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("creating log directory {}", log_dir.display()))?;
        let file_name = format!(
            "test_{}_{name}.csv",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let path = log_dir.join(&file_name);
        let mut file = std::fs::File::create(&path)
            .with_context(|| format!("creating log file {}", path.display()))?;

        writeln!(file, "{}", calibration_comment(hardware).await)?;

        let defaults = hardware.state_defaults().await;
        let mut headers = vec!["timestamp".to_string()];
        let mut columns = Vec::new();
        for board in hardware.boards().await {
            let state = serde_json::to_value(board.state().await).unwrap_or(Value::Null);
            let desired = serde_json::to_value(board.desired_state().await).unwrap_or(Value::Null);
            for (snapshot, is_desired) in [(&state, false), (&desired, true)] {
                for family in HardwareType::ALL {
                    let Some(items) = snapshot.get(family.key()).and_then(Value::as_object) else {
                        continue;
                    };
                    let Some(fields) = defaults.get(&family) else {
                        continue;
                    };
                    for item in items.keys() {
                        for field in fields.keys() {
                            let suffix = if is_desired { "_desiredstate" } else { "" };
                            headers.push(format!(
                                "{}_{}_{}_{}{}",
                                board.name, family, item, field, suffix
                            ));
                            columns.push(Column {
                                board: board.name.clone(),
                                family,
                                item: item.clone(),
                                field: field.clone(),
                                desired: is_desired,
                            });
                        }
                    }
                }
            }
        }

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&headers)?;
        writer.flush()?;
        info!("board state log {file_name} opened ({} columns)", columns.len());

        Ok(Self {
            file_name,
            writer,
            columns,
            start: Instant::now(),
        })
    }

    /// Appends one sample of every column. Boards that disappeared (config
    /// reload mid-log) produce empty cells rather than errors.
    pub async fn write_row(&mut self, hardware: &HardwareHandler) {
        let mut snapshots: BTreeMap<String, (Value, Value)> = BTreeMap::new();
        for board in hardware.boards().await {
            snapshots.insert(
                board.name.clone(),
                (
                    serde_json::to_value(board.state().await).unwrap_or(Value::Null),
                    serde_json::to_value(board.desired_state().await).unwrap_or(Value::Null),
                ),
            );
        }

        let mut record = Vec::with_capacity(self.columns.len() + 1);
        record.push(format!("{:.6}", self.start.elapsed().as_secs_f64()));
        for column in &self.columns {
            let cell = snapshots
                .get(&column.board)
                .map(|(state, desired)| if column.desired { desired } else { state })
                .and_then(|snapshot| snapshot.get(column.family.key()))
                .and_then(|items| items.get(&column.item))
                .and_then(|item| item.get(&column.field))
                .map(cell_text)
                .unwrap_or_default();
            record.push(cell);
        }

        if let Err(e) = self.writer.write_record(&record) {
            warn!("board state log {}: write failed: {e}", self.file_name);
            return;
        }
        if let Err(e) = self.writer.flush() {
            warn!("board state log {}: flush failed: {e}", self.file_name);
        }
    }

    pub fn close(mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("board state log {}: final flush failed: {e}", self.file_name);
        }
        info!("board state log {} closed", self.file_name);
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn calibration_comment(hardware: &HardwareHandler) -> String {
    let mut comment = format!(
        "#Test started at {} ",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    for board in hardware.boards().await {
        let families = [
            (HardwareType::Pts, &board.config.pts),
            (HardwareType::Tcs, &board.config.tcs),
            (HardwareType::Loadcells, &board.config.loadcells),
        ];
        for (family, items) in families {
            for (item_name, item) in items {
                if item.adc.unwrap_or(false) {
                    comment.push_str(&format!(
                        "ADC_{}_{}_gain:{}_offset:{} ",
                        family,
                        item_name,
                        item.gain.unwrap_or(1.0),
                        item.offset.unwrap_or(0.0)
                    ));
                }
            }
        }
    }
    comment
}

// ── Tests ─────────────────────────────────────────────────────────────────────
