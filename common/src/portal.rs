//! Configuration portal: the `/config` form, submission handling and the
//! captive portal decision.

use crate::{
    config::keys,
    error::SubmissionError,
    http::FormFields,
    params::{Encoding, Parameter, ParameterSet},
    status::escape_html,
};

/// Shortest AP password the access point accepts (WPA2).
pub const MIN_AP_PASSWORD_LEN: usize = 8;

/// Builds the form page. Hidden parameters are left out and password inputs
/// are always rendered empty.
pub fn render_config_page(params: &ParameterSet, thing_name: &str, message: Option<&str>) -> String {
    let title = escape_html(thing_name);

    let mut page = String::with_capacity(4096);
    page.push_str("<!DOCTYPE html><html lang=\"en\"><head>");
    page.push_str(
        "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1, user-scalable=no\"/>",
    );
    page.push_str(&format!("<title>{title} config</title>"));
    page.push_str(
        "<style>body{font-family:verdana;} fieldset{border-radius:0.3rem;margin:0px 0px 8px 0px;} label{display:block;margin-top:6px;} .msg{color:#06c;}</style>",
    );
    page.push_str("</head><body>");

    if let Some(message) = message {
        page.push_str(&format!("<p class=msg>{}</p>", escape_html(message)));
    }

    page.push_str("<form action=\"config\" method=\"post\">");
    for group in params.groups() {
        let visible: Vec<&Parameter> = group.items().iter().filter(|p| p.is_visible()).collect();
        if visible.is_empty() {
            continue;
        }

        page.push_str(&format!(
            "<fieldset id=\"{}\"><legend>{}</legend>",
            group.id(),
            escape_html(group.label())
        ));
        for param in visible {
            push_field(&mut page, param);
        }
        page.push_str("</fieldset>");
    }
    page.push_str("<button type=\"submit\">Apply</button></form>");
    page.push_str("<p><a href='/'>Return to home page.</a></p>");
    page.push_str("</body></html>");
    page
}

fn push_field(page: &mut String, param: &Parameter) {
    let key = param.key();
    page.push_str(&format!(
        "<label for=\"{key}\">{}</label>",
        escape_html(param.label())
    ));

    match param.encoding() {
        Encoding::Number { min, max } => page.push_str(&format!(
            "<input type=\"number\" id=\"{key}\" name=\"{key}\" min=\"{min}\" max=\"{max}\" step=\"1\" value=\"{}\"/>",
            escape_html(param.value())
        )),
        Encoding::Select { choices } => {
            page.push_str(&format!("<select id=\"{key}\" name=\"{key}\">"));
            for choice in choices {
                let selected = if choice.value == param.value() {
                    " selected"
                } else {
                    ""
                };
                page.push_str(&format!(
                    "<option value=\"{}\"{selected}>{}</option>",
                    escape_html(choice.value),
                    escape_html(choice.label)
                ));
            }
            page.push_str("</select>");
        }
        Encoding::Text => page.push_str(&format!(
            "<input type=\"text\" id=\"{key}\" name=\"{key}\" maxlength=\"{}\" value=\"{}\"/>",
            param.capacity() - 1,
            escape_html(param.value())
        )),
        Encoding::Password => page.push_str(&format!(
            "<input type=\"password\" id=\"{key}\" name=\"{key}\" maxlength=\"{}\" placeholder=\"unchanged if empty\" value=\"\"/>",
            param.capacity() - 1
        )),
    }
}

/// Value a submitted field would store, or `None` when the field leaves the
/// parameter untouched (absent, hidden, or an empty password).
fn submitted_value<'f>(param: &Parameter, form: &'f FormFields) -> Option<&'f str> {
    if !param.is_visible() {
        return None;
    }
    let value = form.get(param.key())?;
    match param.encoding() {
        Encoding::Password if value.is_empty() => None,
        Encoding::Number { .. } => Some(value.trim()),
        _ => Some(value.as_str()),
    }
}

/// Checks every submitted field without touching `params`.
pub fn validate_submission(params: &ParameterSet, form: &FormFields) -> Result<(), SubmissionError> {
    for param in params.iter() {
        let Some(value) = submitted_value(param, form) else {
            continue;
        };
        param.validate(value)?;

        match param.key() {
            keys::THING_NAME if value.trim().is_empty() => {
                return Err(SubmissionError::Empty {
                    label: param.label().to_string(),
                });
            }
            keys::AP_PASSWORD if value.len() < MIN_AP_PASSWORD_LEN => {
                return Err(SubmissionError::TooShort {
                    label: param.label().to_string(),
                    min: MIN_AP_PASSWORD_LEN,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Validates the whole submission first, then writes it. Either every
/// submitted field is applied or none is.
pub fn apply_submission(params: &mut ParameterSet, form: &FormFields) -> Result<usize, SubmissionError> {
    validate_submission(params, form)?;

    let mut applied = 0;
    for param in params.iter_mut() {
        let Some(value) = submitted_value(param, form).map(str::to_string) else {
            continue;
        };
        param.set_value(&value);
        applied += 1;
    }
    Ok(applied)
}

fn host_name(host: &str) -> &str {
    // Strip a port, leaving bracketed IPv6 literals alone.
    match host.rsplit_once(':') {
        Some((name, port)) if !name.ends_with(']') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Where a request should be sent instead when the node is serving its own
/// access point and the client asked for some other host. A non-default
/// `port` is kept in the target.
pub fn captive_redirect(
    host: Option<&str>,
    thing_name: &str,
    ap_ip: &str,
    port: Option<u16>,
) -> Option<String> {
    let target = match port {
        Some(port) if port != 80 => format!("http://{ap_ip}:{port}/"),
        _ => format!("http://{ap_ip}/"),
    };
    let Some(host) = host else {
        return Some(target);
    };

    let name = host_name(host.trim());
    let local = name.eq_ignore_ascii_case(ap_ip)
        || name.eq_ignore_ascii_case(thing_name)
        || name
            .strip_suffix(".local")
            .is_some_and(|stem| stem.eq_ignore_ascii_case(thing_name));

    (!local).then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::node_parameters, http::parse_form};
    use pretty_assertions::assert_eq;

    #[test]
    fn form_skips_hidden_and_never_echoes_passwords() {
        let params = node_parameters().unwrap();
        let page = render_config_page(&params, "NMEA2000-BME280", None);

        assert!(page.contains("name=\"nmeaconfig-instance\""));
        assert!(page.contains("name=\"TempSource\""));
        assert!(!page.contains("name=\"nmeaconfig-source\""));
        assert!(!page.contains("name=\"nmeaconfig-sourcepressure\""));
        assert!(!page.contains("123456789"));
        assert!(page.contains("<option value=\"4\" selected>main cabin</option>"));
    }

    #[test]
    fn form_shows_error_message() {
        let params = node_parameters().unwrap();
        let page = render_config_page(&params, "node", Some("SID: <bad>"));
        assert!(page.contains("<p class=msg>SID: &lt;bad&gt;</p>"));
    }

    #[test]
    fn submission_applies_visible_fields() {
        let mut params = node_parameters().unwrap();
        let form = parse_form("nmeaconfig-instance=7&nmeaconfig-sid=+12&TempSource=1&iwcThingName=boat");

        assert_eq!(apply_submission(&mut params, &form), Ok(4));
        assert_eq!(params.value(keys::INSTANCE), "7");
        assert_eq!(params.value(keys::SID), "12");
        assert_eq!(params.value(keys::TEMP_SOURCE), "1");
        assert_eq!(params.value(keys::THING_NAME), "boat");
        assert_eq!(params.value(keys::HUMIDITY_SOURCE), "1");
    }

    #[test]
    fn empty_password_keeps_current_value() {
        let mut params = node_parameters().unwrap();
        let form = parse_form("iwcApPassword=&iwcWifiPassword=secret-wifi");

        apply_submission(&mut params, &form).unwrap();
        assert_eq!(params.value(keys::AP_PASSWORD), "123456789");
        assert_eq!(params.value(keys::WIFI_PASSWORD), "secret-wifi");
    }

    #[test]
    fn hidden_fields_cannot_be_submitted() {
        let mut params = node_parameters().unwrap();
        let form = parse_form("nmeaconfig-source=99");

        assert_eq!(apply_submission(&mut params, &form), Ok(0));
        assert_eq!(params.value(keys::SOURCE), "22");
    }

    #[test]
    fn rejects_out_of_range_and_applies_nothing() {
        let mut params = node_parameters().unwrap();
        let before = params.clone();
        let form = parse_form("nmeaconfig-sid=3&OfflineTimeout=5000");

        let err = apply_submission(&mut params, &form).unwrap_err();
        assert!(matches!(err, SubmissionError::OutOfRange { value: 5000, .. }));
        assert_eq!(params, before);
    }

    #[test]
    fn rejects_unknown_choice() {
        let mut params = node_parameters().unwrap();
        let form = parse_form("TempSource=99");

        assert!(matches!(
            apply_submission(&mut params, &form),
            Err(SubmissionError::UnknownChoice { .. })
        ));
        assert_eq!(params.value(keys::TEMP_SOURCE), "4");
    }

    #[test]
    fn rejects_short_ap_password_and_empty_thing_name() {
        let params = node_parameters().unwrap();

        assert!(matches!(
            validate_submission(&params, &parse_form("iwcApPassword=short")),
            Err(SubmissionError::TooShort { min: 8, .. })
        ));
        assert!(matches!(
            validate_submission(&params, &parse_form("iwcThingName=+")),
            Err(SubmissionError::Empty { .. })
        ));
    }

    #[test]
    fn captive_redirect_only_for_foreign_hosts() {
        let ap_ip = "192.168.4.1";

        assert_eq!(captive_redirect(Some("192.168.4.1"), "boat", ap_ip, None), None);
        assert_eq!(captive_redirect(Some("192.168.4.1:80"), "boat", ap_ip, None), None);
        assert_eq!(captive_redirect(Some("Boat"), "boat", ap_ip, None), None);
        assert_eq!(captive_redirect(Some("boat.local"), "boat", ap_ip, None), None);
        assert_eq!(
            captive_redirect(Some("connectivitycheck.gstatic.com"), "boat", ap_ip, None),
            Some("http://192.168.4.1/".to_string())
        );
        assert_eq!(
            captive_redirect(None, "boat", ap_ip, None),
            Some("http://192.168.4.1/".to_string())
        );
    }

    #[test]
    fn captive_redirect_keeps_listening_port() {
        assert_eq!(
            captive_redirect(Some("localhost:8080"), "boat", "127.0.0.1", Some(8080)),
            Some("http://127.0.0.1:8080/".to_string())
        );
        assert_eq!(
            captive_redirect(Some("127.0.0.1:8080"), "boat", "127.0.0.1", Some(8080)),
            None
        );
        assert_eq!(
            captive_redirect(Some("example.com"), "boat", "192.168.4.1", Some(80)),
            Some("http://192.168.4.1/".to_string())
        );
    }
}
