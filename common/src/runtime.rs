use serde::Serialize;

use crate::{
    config::fallback,
    types::{HumiditySource, SourceChannel, TempSource},
};

/// Typed view of the parameter buffers, consumed by the bus messaging layer
/// and the status pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeState {
    pub instance: u8,
    pub sid: u8,
    pub source: u8,
    pub source_pressure: u8,
    pub source_humidity: u8,
    pub temp_source: TempSource,
    pub humidity_source: HumiditySource,
    pub offline_timeout_min: u16,
    pub ap_timeout_sec: u16,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            instance: fallback::INSTANCE,
            sid: fallback::SID,
            source: fallback::SOURCE,
            source_pressure: fallback::SOURCE_PRESSURE,
            source_humidity: fallback::SOURCE_HUMIDITY,
            temp_source: TempSource::FALLBACK,
            humidity_source: HumiditySource::FALLBACK,
            offline_timeout_min: fallback::OFFLINE_TIMEOUT_MIN,
            ap_timeout_sec: fallback::AP_TIMEOUT_SEC,
        }
    }
}

impl RuntimeState {
    pub fn source_address(&self, channel: SourceChannel) -> u8 {
        match channel {
            SourceChannel::Temperature => self.source,
            SourceChannel::Pressure => self.source_pressure,
            SourceChannel::Humidity => self.source_humidity,
        }
    }

    /// Returns `true` when the address actually changed.
    pub fn set_source_address(&mut self, channel: SourceChannel, address: u8) -> bool {
        let slot = match channel {
            SourceChannel::Temperature => &mut self.source,
            SourceChannel::Pressure => &mut self.source_pressure,
            SourceChannel::Humidity => &mut self.source_humidity,
        };
        if *slot == address {
            return false;
        }
        *slot = address;
        true
    }

    pub fn offline_timeout_ms(&self) -> u64 {
        u64::from(self.offline_timeout_min) * 60_000
    }
}
