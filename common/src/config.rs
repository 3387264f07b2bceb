use crate::{
    error::ConfigError,
    params::{Choice, Parameter, ParameterGroup, ParameterSet},
};

/// Persisted layout tag. Bump whenever keys or encodings change; a stored
/// document with another tag is discarded on load.
pub const CONFIG_VERSION: &str = "A1";

pub const DEFAULT_THING_NAME: &str = "NMEA2000-BME280";
pub const DEFAULT_AP_PASSWORD: &str = "123456789";

pub mod keys {
    pub const THING_NAME: &str = "iwcThingName";
    pub const AP_PASSWORD: &str = "iwcApPassword";
    pub const WIFI_SSID: &str = "iwcWifiSsid";
    pub const WIFI_PASSWORD: &str = "iwcWifiPassword";
    pub const AP_TIMEOUT: &str = "iwcApTimeout";

    pub const INSTANCE: &str = "nmeaconfig-instance";
    pub const SID: &str = "nmeaconfig-sid";
    pub const SOURCE: &str = "nmeaconfig-source";
    pub const SOURCE_PRESSURE: &str = "nmeaconfig-sourcepressure";
    pub const SOURCE_HUMIDITY: &str = "nmeaconfig-sourcehumidity";

    pub const TEMP_SOURCE: &str = "TempSource";
    pub const HUMIDITY_SOURCE: &str = "HumiditySource";
    pub const OFFLINE_TIMEOUT: &str = "OfflineTimeout";
}

pub const TEMP_SOURCE_CHOICES: &[Choice] = &[
    Choice { value: "1", label: "outside" },
    Choice { value: "2", label: "inside" },
    Choice { value: "3", label: "engine room" },
    Choice { value: "4", label: "main cabin" },
    Choice { value: "7", label: "refrigeration" },
    Choice { value: "8", label: "heating system" },
    Choice { value: "13", label: "freezer" },
    Choice { value: "14", label: "exhaust gas" },
];

pub const HUMIDITY_SOURCE_CHOICES: &[Choice] = &[
    Choice { value: "1", label: "inside" },
    Choice { value: "2", label: "outside" },
    Choice { value: "255", label: "unknown" },
];

/// Fallbacks used by the translator when a buffer does not parse.
pub mod fallback {
    pub const INSTANCE: u8 = 255;
    pub const SID: u8 = 255;
    pub const SOURCE: u8 = 22;
    pub const SOURCE_PRESSURE: u8 = 23;
    pub const SOURCE_HUMIDITY: u8 = 24;
    pub const OFFLINE_TIMEOUT_MIN: u16 = 0;
    pub const AP_TIMEOUT_SEC: u16 = 30;
}

pub const MAX_BUS_ADDRESS: i64 = 253;
pub const MAX_OFFLINE_TIMEOUT_MIN: i64 = 1_440;
pub const MAX_AP_TIMEOUT_SEC: i64 = 600;

/// Builds the full parameter set of the node with default values.
pub fn node_parameters() -> Result<ParameterSet, ConfigError> {
    let system = ParameterGroup::new("iwcSys", "System configuration")
        .with(Parameter::text("Thing name", keys::THING_NAME, DEFAULT_THING_NAME, 33))
        .with(Parameter::password(
            "AP password",
            keys::AP_PASSWORD,
            DEFAULT_AP_PASSWORD,
            33,
        ))
        .with(Parameter::text("WiFi SSID", keys::WIFI_SSID, "", 33))
        .with(Parameter::password("WiFi password", keys::WIFI_PASSWORD, "", 65))
        .with(Parameter::number(
            "Startup delay (seconds)",
            keys::AP_TIMEOUT,
            "30",
            0,
            MAX_AP_TIMEOUT_SEC,
        ));

    let nmea = ParameterGroup::new("nmeaconfig", "NMEA configuration")
        .with(Parameter::number("Instance", keys::INSTANCE, "255", 1, 255))
        .with(Parameter::number("SID", keys::SID, "255", 1, 255))
        .with(Parameter::number("Source", keys::SOURCE, "22", 0, MAX_BUS_ADDRESS).hidden())
        .with(
            Parameter::number(
                "SourcePressure",
                keys::SOURCE_PRESSURE,
                "23",
                0,
                MAX_BUS_ADDRESS,
            )
            .hidden(),
        )
        .with(
            Parameter::number(
                "SourceHumidity",
                keys::SOURCE_HUMIDITY,
                "24",
                0,
                MAX_BUS_ADDRESS,
            )
            .hidden(),
        );

    let sources = ParameterGroup::new("SysConf", "Source")
        .with(Parameter::select(
            "Temperature source",
            keys::TEMP_SOURCE,
            TEMP_SOURCE_CHOICES,
            "4",
        ))
        .with(Parameter::select(
            "Humidity source",
            keys::HUMIDITY_SOURCE,
            HUMIDITY_SOURCE_CHOICES,
            "1",
        ))
        .with(Parameter::number(
            "Auto offline (minutes, 0 = never)",
            keys::OFFLINE_TIMEOUT,
            "0",
            0,
            MAX_OFFLINE_TIMEOUT_MIN,
        ));

    ParameterSet::new(vec![system, nmea, sources])
}
