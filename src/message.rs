//! Message data model and publish-time validation rules.

use std::collections::HashMap;

use crate::error::Status;
use crate::time::PreciseDate;

/// 10 MiB, the maximum total size of a message (data + attribute bytes).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
/// Maximum length, in UTF-8 bytes, of an ordering key.
pub const MAX_ORDERING_KEY_BYTES: usize = 1024;
/// Maximum length, in UTF-8 bytes, of an attribute key.
pub const MAX_ATTRIBUTE_KEY_BYTES: usize = 256;
/// Maximum length, in UTF-8 bytes, of an attribute value.
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 1024;

/// A draft message as handed to a `Publisher`, before the broker assigns it
/// an id and a `publish_time`.
#[derive(Clone, Debug, Default)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

impl PublishMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            attributes: HashMap::new(),
            ordering_key: None,
        }
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Data bytes plus the UTF-8 byte length of every attribute key and value.
    pub fn length(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.data.len() + attrs
    }

    /// Validates size, attribute, and ordering-key constraints. Does not
    /// check the ordering-key-pause state — that's the publisher's concern.
    pub fn validate(&self) -> Result<(), Status> {
        if self.length() > MAX_MESSAGE_BYTES {
            return Err(Status::invalid_argument(format!(
                "message size {} exceeds the maximum of {} bytes",
                self.length(),
                MAX_MESSAGE_BYTES
            )));
        }
        for (key, value) in &self.attributes {
            if key.is_empty() {
                return Err(Status::invalid_argument("attribute keys must not be empty"));
            }
            if key.len() > MAX_ATTRIBUTE_KEY_BYTES {
                return Err(Status::invalid_argument(format!(
                    "attribute key {key:?} exceeds {MAX_ATTRIBUTE_KEY_BYTES} bytes"
                )));
            }
            if key.starts_with("goog") || key.starts_with("googclient_") {
                return Err(Status::invalid_argument(format!(
                    "attribute key {key:?} uses the reserved \"goog\" prefix"
                )));
            }
            if value.len() > MAX_ATTRIBUTE_VALUE_BYTES {
                return Err(Status::invalid_argument(format!(
                    "attribute value for key {key:?} exceeds {MAX_ATTRIBUTE_VALUE_BYTES} bytes"
                )));
            }
        }
        if let Some(key) = &self.ordering_key {
            if key.is_empty() {
                return Err(Status::invalid_argument(
                    "ordering_key must not be an empty string; omit it instead",
                ));
            }
            if key.len() > MAX_ORDERING_KEY_BYTES {
                return Err(Status::invalid_argument(format!(
                    "ordering_key exceeds {MAX_ORDERING_KEY_BYTES} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// An admitted, immutable message living inside the broker.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub publish_time: PreciseDate,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
}

impl Message {
    pub(crate) fn admit(id: String, draft: PublishMessage, publish_time: PreciseDate) -> Self {
        Self {
            id,
            data: draft.data,
            attributes: draft.attributes,
            publish_time,
            ordering_key: draft.ordering_key,
            delivery_attempt: 1,
        }
    }

    pub fn length(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.data.len() + attrs
    }

    pub fn publish_time(&self) -> PreciseDate {
        self.publish_time
    }
}
