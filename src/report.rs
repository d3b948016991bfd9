// MetricReport payload codec, the sensor-side sample batch format.
// Numan Thabit 2025

use thiserror::Error;

/// Maximum float32 samples carried by one report.
pub const MAX_SAMPLES: usize = 128;

/// Fixed report header: timestamp(8) + interval(4) + type(1) + count(4).
pub const REPORT_HDR_LEN: usize = 17;

/// Largest encoded report body.
pub const MAX_REPORT_LEN: usize = REPORT_HDR_LEN + MAX_SAMPLES * 4;

/// Sample payload kind.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Generic float32 samples.
    Float32 = 0x00,
    /// Temperature in degrees Celsius.
    Temperature = 0x01,
    /// Relative humidity in percent.
    Humidity = 0x02,
    /// Illuminance in lux.
    Lux = 0x04,
}

impl DataType {
    /// Returns the enum variant for a raw type byte when known.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(DataType::Float32),
            0x01 => Some(DataType::Temperature),
            0x02 => Some(DataType::Humidity),
            0x04 => Some(DataType::Lux),
            _ => None,
        }
    }
}

/// Report codec error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    /// Sample count above [`MAX_SAMPLES`].
    #[error("sample count {0} exceeds limit")]
    TooManySamples(usize),
    /// Buffer ended before the declared sample data.
    #[error("report truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    /// Unknown data-type byte.
    #[error("unknown data type {0:#04x}")]
    UnknownDataType(u8),
}

/// A batch of sensor samples as carried inside `METRICS_REPORT`.
///
/// Timestamps are Unix milliseconds; the interval between samples is in
/// microseconds. All fields little-endian on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricReport {
    /// Capture time of the first sample, Unix milliseconds.
    pub start_timestamp_ms: u64,
    /// Spacing between consecutive samples, microseconds.
    pub sample_interval_us: u32,
    /// Kind of quantity sampled.
    pub data_type: DataType,
    /// Sample values, at most [`MAX_SAMPLES`].
    pub samples: Vec<f32>,
}

impl MetricReport {
    /// Serialises the report body.
    pub fn encode(&self) -> Result<Vec<u8>, ReportError> {
        if self.samples.len() > MAX_SAMPLES {
            return Err(ReportError::TooManySamples(self.samples.len()));
        }

        let mut buf = Vec::with_capacity(REPORT_HDR_LEN + self.samples.len() * 4);
        buf.extend_from_slice(&self.start_timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&self.sample_interval_us.to_le_bytes());
        buf.push(self.data_type as u8);
        buf.extend_from_slice(&(self.samples.len() as u32).to_le_bytes());
        for sample in &self.samples {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(buf)
    }

    /// Parses a report body.
    pub fn parse(bytes: &[u8]) -> Result<Self, ReportError> {
        if bytes.len() < REPORT_HDR_LEN {
            return Err(ReportError::Truncated {
                expected: REPORT_HDR_LEN,
                actual: bytes.len(),
            });
        }

        let start_timestamp_ms = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let sample_interval_us = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let data_type =
            DataType::from_raw(bytes[12]).ok_or(ReportError::UnknownDataType(bytes[12]))?;
        let count = u32::from_le_bytes(bytes[13..17].try_into().unwrap()) as usize;

        if count > MAX_SAMPLES {
            return Err(ReportError::TooManySamples(count));
        }
        let expected = REPORT_HDR_LEN + count * 4;
        if bytes.len() < expected {
            return Err(ReportError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let mut samples = Vec::with_capacity(count);
        for chunk in bytes[REPORT_HDR_LEN..expected].chunks_exact(4) {
            samples.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }

        Ok(Self {
            start_timestamp_ms,
            sample_interval_us,
            data_type,
            samples,
        })
    }
}
