use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;
use prost::Message;

use crate::TrainingError;

pub const LOG_FILENAME: &str = "log.txt";

/// Destination for `(tag, value, step)` scalar points.
pub trait ScalarSink: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarPoint {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Keeps points in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    points: Arc<Mutex<Vec<ScalarPoint>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<ScalarPoint> {
        self.points.lock().clone()
    }

    pub fn points_for(&self, tag: &str) -> Vec<ScalarPoint> {
        self.points
            .lock()
            .iter()
            .filter(|point| point.tag == tag)
            .cloned()
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TrainingError> {
        self.points.lock().push(ScalarPoint {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }
}

/// Writes TensorBoard `events.out.tfevents.*` record files.
pub struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let record = encode_record(event)?;
        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            ScalarSink::flush(self)?;
        }
        Ok(())
    }
}

impl ScalarSink for TensorBoardWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = ScalarSink::flush(self);
    }
}

/// `u64 len | masked crc(len) | payload | masked crc(payload)`, little endian.
fn encode_record(event: &Event) -> Result<BytesMut, TrainingError> {
    let mut payload = BytesMut::with_capacity(event.encoded_len());
    event.encode(&mut payload).map_err(|err| {
        TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
    })?;

    let len_bytes = (payload.len() as u64).to_le_bytes();
    let mut record = BytesMut::with_capacity(payload.len() + 16);
    record.put_slice(&len_bytes);
    record.put_u32_le(masked_crc32(&len_bytes));
    record.put_slice(&payload);
    record.put_u32_le(masked_crc32(&payload));
    Ok(record)
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Appends one JSON object per line to `path`, creating it if needed.
pub fn append_json_line(path: &Path, record: &serde_json::Value) -> Result<(), TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn read_events(path: &Path) -> Vec<Event> {
        let mut data = bytes::Bytes::from(fs::read(path).unwrap());
        let mut events = Vec::new();
        while data.has_remaining() {
            let len_bytes = data.copy_to_bytes(8);
            assert_eq!(data.get_u32_le(), masked_crc32(&len_bytes));
            let len = u64::from_le_bytes(len_bytes.as_ref().try_into().unwrap()) as usize;
            let payload = data.copy_to_bytes(len);
            assert_eq!(data.get_u32_le(), masked_crc32(&payload));
            events.push(Event::decode(payload).unwrap());
        }
        events
    }

    #[test]
    fn event_file_starts_with_version_and_frames_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut writer = TensorBoardWriter::create(dir.path(), 100).unwrap();
            writer.add_scalar("loss", 0.5, 1250).unwrap();
            writer.add_scalar("lr", 0.001, 1250).unwrap();
            writer.path().to_path_buf()
        };

        let events = read_events(&path);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));
        let scalar = events[1].summary.as_ref().unwrap();
        assert_eq!(scalar.value[0].tag, "loss");
        assert_eq!(scalar.value[0].simple_value, Some(0.5));
        assert_eq!(events[2].step, 1250);
    }

    #[test]
    fn memory_sink_clones_share_points() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.add_scalar("perf/test_acc1", 75.0, 3).unwrap();

        assert_eq!(
            sink.points_for("perf/test_acc1"),
            vec![ScalarPoint {
                tag: "perf/test_acc1".into(),
                value: 75.0,
                step: 3
            }]
        );
    }

    #[test]
    fn json_lines_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join(LOG_FILENAME);
        append_json_line(&path, &serde_json::json!({"epoch": 0})).unwrap();
        append_json_line(&path, &serde_json::json!({"epoch": 1})).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec![r#"{"epoch":0}"#, r#"{"epoch":1}"#]);
    }
}
