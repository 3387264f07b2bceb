use serde::Serialize;

/// Latest values produced by the acquisition side. `None` until the first
/// successful read of that quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SensorReadings {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
}

impl SensorReadings {
    pub fn dew_point_c(&self) -> Option<f64> {
        dew_point_c(self.temperature_c?, self.humidity_pct?)
    }

    pub fn heat_index_c(&self) -> Option<f64> {
        Some(heat_index_c(self.temperature_c?, self.humidity_pct?))
    }
}

pub fn celsius_to_fahrenheit(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

pub fn fahrenheit_to_celsius(temp_f: f64) -> f64 {
    (temp_f - 32.0) * 5.0 / 9.0
}

/// Magnus approximation. Undefined for a relative humidity of zero.
pub fn dew_point_c(temp_c: f64, humidity_pct: f64) -> Option<f64> {
    const A: f64 = 17.62;
    const B: f64 = 243.12;

    if !(humidity_pct > 0.0 && humidity_pct <= 100.0) {
        return None;
    }

    let gamma = (humidity_pct / 100.0).ln() + A * temp_c / (B + temp_c);
    Some(B * gamma / (A - gamma))
}

/// NOAA heat index: the simple formula, switching to the Rothfusz regression
/// (with its low/high humidity adjustments) once the result reaches 80 °F.
pub fn heat_index_c(temp_c: f64, humidity_pct: f64) -> f64 {
    let t = celsius_to_fahrenheit(temp_c);
    let rh = humidity_pct;

    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    if (simple + t) / 2.0 < 80.0 {
        return fahrenheit_to_celsius(simple);
    }

    let mut hi = -42.379 + 2.049_015_23 * t + 10.143_331_27 * rh
        - 0.224_755_41 * t * rh
        - 0.006_837_83 * t * t
        - 0.054_817_17 * rh * rh
        + 0.001_228_74 * t * t * rh
        + 0.000_852_82 * t * rh * rh
        - 0.000_001_99 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
    } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 5.0);
    }

    fahrenheit_to_celsius(hi)
}
