pub mod config;
pub mod error;
pub mod http;
pub mod inactivity;
pub mod params;
pub mod portal;
pub mod runtime;
pub mod save;
pub mod sensor;
pub mod service;
pub mod status;
pub mod store;
pub mod topics;
pub mod translate;
pub mod types;

pub use config::{keys, node_parameters, CONFIG_VERSION};
pub use error::{ConfigError, StoreError, SubmissionError};
pub use http::{HttpRequest, HttpResponse, RequestKind};
pub use params::{Parameter, ParameterGroup, ParameterSet};
pub use runtime::RuntimeState;
pub use sensor::SensorReadings;
pub use service::{
    Coordinator, Event, EventSource, Inbound, NetworkControl, OtaHandler, Services, TickReport,
};
pub use status::NetworkDiagnostics;
pub use store::{ParameterStore, StoredParameters};
pub use topics::*;
pub use types::{BusAnnounce, BusReading, HumiditySource, SourceChannel, TempSource};
