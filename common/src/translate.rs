//! Parameter buffers to [`RuntimeState`].
//!
//! Translation never fails: every field has an explicit fallback that is used
//! when its buffer is empty, not numeric, not representable, outside the
//! declared range, or not one of the offered choices.

use crate::{
    config::{fallback, keys},
    params::{Encoding, ParameterSet},
    runtime::RuntimeState,
    types::{HumiditySource, TempSource},
};

/// Leading-integer parse in the spirit of C `atoi`: optional whitespace, an
/// optional sign, then digits; trailing garbage is ignored. Returns `fallback`
/// when there are no digits or the value does not fit in `T`.
pub fn parse_or_default<T>(raw: &str, fallback: T) -> T
where
    T: TryFrom<i64>,
{
    leading_integer(raw)
        .and_then(|value| T::try_from(value).ok())
        .unwrap_or(fallback)
}

fn leading_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let end = digits
        .bytes()
        .position(|byte| !byte.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let magnitude = digits[..end].parse::<i64>().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Parses `key` and applies its declared numeric range on top of the type
/// bounds. Unknown keys yield the fallback.
fn number_field<T>(params: &ParameterSet, key: &str, fallback: T) -> T
where
    T: TryFrom<i64> + Copy,
{
    let Some(param) = params.get(key) else {
        return fallback;
    };

    let Some(value) = leading_integer(param.value()) else {
        return fallback;
    };

    if let Encoding::Number { min, max } = param.encoding() {
        if !(min..=max).contains(&value) {
            return fallback;
        }
    }

    T::try_from(value).unwrap_or(fallback)
}

fn temp_source(params: &ParameterSet) -> TempSource {
    let code = parse_or_default::<u8>(params.value(keys::TEMP_SOURCE), TempSource::FALLBACK.code());
    TempSource::from_code(code).unwrap_or(TempSource::FALLBACK)
}

fn humidity_source(params: &ParameterSet) -> HumiditySource {
    let code = parse_or_default::<u8>(
        params.value(keys::HUMIDITY_SOURCE),
        HumiditySource::FALLBACK.code(),
    );
    HumiditySource::from_code(code).unwrap_or(HumiditySource::FALLBACK)
}

/// Builds a fresh runtime state from the current buffers.
pub fn translate(params: &ParameterSet) -> RuntimeState {
    RuntimeState {
        instance: number_field(params, keys::INSTANCE, fallback::INSTANCE),
        sid: number_field(params, keys::SID, fallback::SID),
        source: number_field(params, keys::SOURCE, fallback::SOURCE),
        source_pressure: number_field(params, keys::SOURCE_PRESSURE, fallback::SOURCE_PRESSURE),
        source_humidity: number_field(params, keys::SOURCE_HUMIDITY, fallback::SOURCE_HUMIDITY),
        temp_source: temp_source(params),
        humidity_source: humidity_source(params),
        offline_timeout_min: number_field(
            params,
            keys::OFFLINE_TIMEOUT,
            fallback::OFFLINE_TIMEOUT_MIN,
        ),
        ap_timeout_sec: number_field(params, keys::AP_TIMEOUT, fallback::AP_TIMEOUT_SEC),
    }
}

/// Replaces `runtime` with the translation of `params`. Returns `true` when
/// anything changed.
pub fn apply(params: &ParameterSet, runtime: &mut RuntimeState) -> bool {
    let next = translate(params);
    if *runtime == next {
        return false;
    }
    *runtime = next;
    true
}
