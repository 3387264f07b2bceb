use serde::Serialize;

use crate::{runtime::RuntimeState, sensor::SensorReadings};

pub const NO_DATA: &str = "no data";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkDiagnostics {
    pub rssi: Option<i32>,
    pub mac: String,
    pub ip: Option<String>,
    pub ap_mode: bool,
    /// Port the web server listens on when it is not 80.
    pub http_port: Option<u16>,
}

/// Body of `GET /data`. Every value is text so the key set never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusData {
    pub rssi: String,
    pub temperature: String,
    pub dewpoint: String,
    pub heatindex: String,
    pub pressure: String,
    pub humidity: String,
}

/// Everything the status views read, captured at request time.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot<'a> {
    pub thing_name: &'a str,
    pub version: &'a str,
    pub runtime: &'a RuntimeState,
    pub readings: &'a SensorReadings,
    pub network: &'a NetworkDiagnostics,
}

fn decimal(value: Option<f64>) -> String {
    match value {
        Some(value) if value.is_finite() => format!("{value:.2}"),
        _ => NO_DATA.to_string(),
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

impl StatusSnapshot<'_> {
    pub fn data(&self) -> StatusData {
        StatusData {
            rssi: self
                .network
                .rssi
                .map(|rssi| rssi.to_string())
                .unwrap_or_else(|| NO_DATA.to_string()),
            temperature: decimal(self.readings.temperature_c),
            dewpoint: decimal(self.readings.dew_point_c()),
            heatindex: decimal(self.readings.heat_index_c()),
            pressure: decimal(self.readings.pressure_hpa),
            humidity: decimal(self.readings.humidity_pct),
        }
    }

    pub fn render_json(&self) -> String {
        // A struct of strings always serializes.
        serde_json::to_string(&self.data()).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn render_html(&self) -> String {
        let data = self.data();
        let title = escape_html(self.thing_name);

        let mut page = String::with_capacity(2048);
        page.push_str("<!DOCTYPE html><html lang=\"en\"><head>");
        page.push_str(
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1, user-scalable=no\"/>",
        );
        page.push_str(&format!("<title>{title}</title>"));
        page.push_str(
            "<style>body{text-align:center;font-family:verdana;} fieldset{border-radius:0.3rem;margin:0px;} td{padding:2px 8px;}</style>",
        );
        page.push_str("<meta http-equiv=refresh content=30 />");
        page.push_str("</head><body>");

        page.push_str("<fieldset align=left style=\"border: 1px solid\">");
        page.push_str(&format!(
            "<legend>{}</legend>",
            escape_html(self.runtime.temp_source.label())
        ));
        page.push_str("<table border=0 align=center>");
        push_row(&mut page, "Temperature", &data.temperature, "&deg;C");
        push_row(&mut page, "Dew point", &data.dewpoint, "&deg;C");
        push_row(&mut page, "Heat index", &data.heatindex, "&deg;C");
        push_row(&mut page, "Pressure", &data.pressure, "mBar");
        push_row(&mut page, "Humidity", &data.humidity, "%");
        page.push_str("</table></fieldset><br>");

        page.push_str("<fieldset align=left style=\"border: 1px solid\">");
        page.push_str("<legend>Network</legend><table border=0 align=center>");
        push_row(&mut page, "RSSI", &data.rssi, "dBm");
        push_row(&mut page, "MAC", &escape_html(&self.network.mac), "");
        let ip = self.network.ip.as_deref().unwrap_or(NO_DATA);
        push_row(&mut page, "IP", &escape_html(ip), "");
        push_row(
            &mut page,
            "Instance / SID",
            &format!("{} / {}", self.runtime.instance, self.runtime.sid),
            "",
        );
        page.push_str("</table></fieldset><br>");

        page.push_str("<table border=0 align=center>");
        page.push_str(
            "<tr><td align=left>Go to <a href='config'>configure page</a> to change configuration.</td></tr>",
        );
        page.push_str(&format!(
            "<tr><td><font size=1>Version: {}</font></td></tr>",
            escape_html(self.version)
        ));
        page.push_str("</table></body></html>");
        page
    }
}

fn push_row(page: &mut String, name: &str, value: &str, unit: &str) {
    let unit = if value == NO_DATA { "" } else { unit };
    page.push_str(&format!(
        "<tr><td align=left>{name}:</td><td>{value}{unit}</td></tr>"
    ));
}
