/// Newline delimited JSON records written to the caller's stream.
///
/// Every record carries a UTC capture timestamp and the monotonic time since
/// the emitter was created. Each line is flushed as soon as it is written so a
/// consumer reading a pipe sees readings as they arrive. Once the session end
/// record has been written the emitter goes quiet.
use std::io::{self, Write};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use log::trace;
use serde::{Serialize, Serializer};

use crate::channel::{ChannelStatus, Config};
use crate::device::{Decoded, Measurement, Quality};
use crate::response::ChannelId;

/// Sensor identity as reported in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub number: u16,
    #[serde(rename = "type")]
    pub device_type: u8,
    pub transmission_type: u8,
}

impl From<&Config> for DeviceIdentity {
    fn from(config: &Config) -> Self {
        DeviceIdentity {
            number: config.get_device_number(),
            device_type: config.get_device_type(),
            transmission_type: config.get_transmission_type(),
        }
    }
}

impl From<ChannelId> for DeviceIdentity {
    fn from(id: ChannelId) -> Self {
        DeviceIdentity {
            number: id.device_number,
            device_type: id.device_type,
            transmission_type: id.transmission_type,
        }
    }
}

fn rfc3339<S: Serializer>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// One decoded broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    #[serde(serialize_with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    pub elapsed_ns: u64,
    pub channel: u8,
    pub device: DeviceIdentity,
    pub page: u8,
    pub kind: &'static str,
    pub data: Measurement,
    pub quality: Quality,
}

#[derive(Serialize)]
struct StatusRecord {
    #[serde(serialize_with = "rfc3339")]
    timestamp: DateTime<Utc>,
    elapsed_ns: u64,
    kind: &'static str,
    channel: u8,
    device: DeviceIdentity,
    status: ChannelStatus,
}

/// Why the session stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SessionEnd {
    Stopped,
    Fault { cause: String },
}

#[derive(Serialize)]
struct EndRecord<'a> {
    #[serde(serialize_with = "rfc3339")]
    timestamp: DateTime<Utc>,
    elapsed_ns: u64,
    kind: &'static str,
    #[serde(flatten)]
    end: &'a SessionEnd,
}

pub struct Emitter<W: Write> {
    out: W,
    started: Instant,
    terminated: bool,
}

impl<W: Write> Emitter<W> {
    pub fn new(out: W) -> Self {
        Emitter {
            out,
            started: Instant::now(),
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn stamp(&self) -> (DateTime<Utc>, u64) {
        let elapsed = self.started.elapsed().as_nanos();
        (Utc::now(), elapsed.min(u64::MAX as u128) as u64)
    }

    /// Builds the record for a decoded broadcast, stamped now.
    pub fn reading(
        &self,
        channel: u8,
        device: DeviceIdentity,
        page: u8,
        decoded: Decoded,
    ) -> SensorReading {
        let (timestamp, elapsed_ns) = self.stamp();
        SensorReading {
            timestamp,
            elapsed_ns,
            channel,
            device,
            page,
            kind: decoded.measurement.kind(),
            data: decoded.measurement,
            quality: decoded.quality,
        }
    }

    pub fn emit(&mut self, reading: &SensorReading) -> io::Result<()> {
        self.write(reading)
    }

    pub fn status(
        &mut self,
        channel: u8,
        device: DeviceIdentity,
        status: ChannelStatus,
    ) -> io::Result<()> {
        let (timestamp, elapsed_ns) = self.stamp();
        self.write(&StatusRecord {
            timestamp,
            elapsed_ns,
            kind: "channel_status",
            channel,
            device,
            status,
        })
    }

    /// Writes the final record. Later writes are dropped.
    pub fn terminate(&mut self, end: SessionEnd) -> io::Result<()> {
        let (timestamp, elapsed_ns) = self.stamp();
        let result = self.write(&EndRecord {
            timestamp,
            elapsed_ns,
            kind: "session_end",
            end: &end,
        });
        self.terminated = true;
        result
    }

    fn write<R: Serialize>(&mut self, record: &R) -> io::Result<()> {
        if self.terminated {
            trace!("Session ended, dropping record");
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.out.write_all(&line)?;
        self.out.flush()
    }
}
