use std::fmt;

const TOPIC_ROOT: &str = "climaduino";
const SETTINGS_SEGMENT: &str = "settings/";

/// Topic namespace of one physical node: `climaduino/<hostname>/`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTopics {
    prefix: String,
    settings_prefix: String,
}

impl DeviceTopics {
    pub fn new(hostname: &str) -> Self {
        let prefix = format!("{}/{}/", TOPIC_ROOT, hostname);
        let settings_prefix = format!("{}{}", prefix, SETTINGS_SEGMENT);
        Self {
            prefix,
            settings_prefix,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wildcard filter covering every setting of this device
    pub fn settings_filter(&self) -> String {
        format!("{}#", self.settings_prefix)
    }

    /// Strips `climaduino/<hostname>/settings/` from an inbound topic.
    /// Topics outside the namespace, or naming no key, yield `None`.
    pub fn setting_key<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.settings_prefix.as_str())
            .filter(|key| !key.is_empty())
    }

    /// Namespaces a bridge key such as `readings/temperature`
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl fmt::Display for DeviceTopics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.prefix)
    }
}
