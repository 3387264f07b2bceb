//! MQTT topics of the host bus bridge, which stands in for the marine bus
//! when running off-target.

pub const TOPIC_BUS_PREFIX: &str = "envsensor/bus";

pub const TOPIC_BUS_TEMPERATURE: &str = "envsensor/bus/temperature";
pub const TOPIC_BUS_HUMIDITY: &str = "envsensor/bus/humidity";
pub const TOPIC_BUS_PRESSURE: &str = "envsensor/bus/pressure";
pub const TOPIC_BUS_ANNOUNCE: &str = "envsensor/bus/announce";

/// Subscription filter for address claims, one sub-topic per source channel.
pub const TOPIC_BUS_CLAIM_FILTER: &str = "envsensor/bus/claim/+";

const CLAIM_PREFIX: &str = "envsensor/bus/claim/";

pub fn claim_topic(channel: crate::types::SourceChannel) -> String {
    format!("{CLAIM_PREFIX}{}", channel.as_str())
}

/// Channel named by a claim topic, if `topic` is one.
pub fn parse_claim_topic(topic: &str) -> Option<crate::types::SourceChannel> {
    topic
        .strip_prefix(CLAIM_PREFIX)
        .and_then(crate::types::SourceChannel::parse)
}
