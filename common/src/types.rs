use serde::{Deserialize, Serialize};

/// Temperature source announced with every temperature reading on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempSource {
    Outside,
    Inside,
    EngineRoom,
    MainCabin,
    Refrigeration,
    HeatingSystem,
    Freezer,
    ExhaustGas,
}

impl TempSource {
    /// Used whenever the stored selection is not one of the offered codes.
    pub const FALLBACK: Self = Self::MainCabin;

    pub const ALL: [Self; 8] = [
        Self::Outside,
        Self::Inside,
        Self::EngineRoom,
        Self::MainCabin,
        Self::Refrigeration,
        Self::HeatingSystem,
        Self::Freezer,
        Self::ExhaustGas,
    ];

    pub fn code(self) -> u8 {
        match self {
            Self::Outside => 1,
            Self::Inside => 2,
            Self::EngineRoom => 3,
            Self::MainCabin => 4,
            Self::Refrigeration => 7,
            Self::HeatingSystem => 8,
            Self::Freezer => 13,
            Self::ExhaustGas => 14,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|source| source.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Outside => "outside",
            Self::Inside => "inside",
            Self::EngineRoom => "engine room",
            Self::MainCabin => "main cabin",
            Self::Refrigeration => "refrigeration",
            Self::HeatingSystem => "heating system",
            Self::Freezer => "freezer",
            Self::ExhaustGas => "exhaust gas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumiditySource {
    Inside,
    Outside,
    Unknown,
}

impl HumiditySource {
    pub const FALLBACK: Self = Self::Inside;

    pub const ALL: [Self; 3] = [Self::Inside, Self::Outside, Self::Unknown];

    pub fn code(self) -> u8 {
        match self {
            Self::Inside => 1,
            Self::Outside => 2,
            Self::Unknown => 255,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|source| source.code() == code)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Inside => "inside",
            Self::Outside => "outside",
            Self::Unknown => "unknown",
        }
    }
}

/// The three bus devices the node claims an address for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceChannel {
    Temperature,
    Pressure,
    Humidity,
}

impl SourceChannel {
    pub const ALL: [Self; 3] = [Self::Temperature, Self::Pressure, Self::Humidity];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Humidity => "humidity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

/// One reading as the host bus bridge publishes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusReading {
    pub instance: u8,
    pub sid: u8,
    pub source: u8,
    /// Temperature or humidity source code; absent for pressure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<u8>,
    pub value: f64,
}

/// Identity the node announces on the bus at startup and after every
/// configuration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusAnnounce {
    pub thing_name: String,
    pub instance: u8,
    pub sid: u8,
    pub source_temperature: u8,
    pub source_pressure: u8,
    pub source_humidity: u8,
}
