//! Transport-neutral request/response shapes exchanged between the web server
//! front end and the service loop.

use std::collections::BTreeMap;

pub type FormFields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `GET /`
    StatusPage,
    /// `GET /data`
    Data,
    /// `GET /config`
    ConfigPage,
    /// `POST /config`
    ConfigSubmit(FormFields),
    /// Anything the router did not match.
    Other { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub kind: RequestKind,
    /// `Host` header, used for captive portal detection.
    pub host: Option<String>,
}

impl HttpRequest {
    pub fn new(kind: RequestKind) -> Self {
        Self { kind, host: None }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }
}

pub const CONTENT_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub location: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: CONTENT_HTML,
            location: None,
            body,
        }
    }

    pub fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_JSON,
            location: None,
            body,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TEXT,
            location: None,
            body: body.into(),
        }
    }

    pub fn redirect(location: String) -> Self {
        Self {
            status: 302,
            content_type: CONTENT_TEXT,
            location: Some(location),
            body: String::new(),
        }
    }

    pub fn service_unavailable() -> Self {
        Self::text(503, "service loop unavailable")
    }
}

/// Decodes an `application/x-www-form-urlencoded` body. Later duplicates win;
/// malformed escapes are kept verbatim.
pub fn parse_form(body: &str) -> FormFields {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(name), percent_decode(value))
        })
        .collect()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                match (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                    (Some(high), Some(low)) => {
                        decoded.push((high << 4) | low);
                        index += 3;
                    }
                    _ => {
                        decoded.push(b'%');
                        index += 1;
                    }
                }
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_form_decodes_values() {
        let form = parse_form("iwcThingName=my+boat%21&TempSource=4&empty=&flag");

        assert_eq!(form["iwcThingName"], "my boat!");
        assert_eq!(form["TempSource"], "4");
        assert_eq!(form["empty"], "");
        assert_eq!(form["flag"], "");
    }

    #[test]
    fn parse_form_keeps_bad_escapes() {
        let form = parse_form("a=100%&b=%zz&c=%C3%A9");

        assert_eq!(form["a"], "100%");
        assert_eq!(form["b"], "%zz");
        assert_eq!(form["c"], "é");
    }
}
