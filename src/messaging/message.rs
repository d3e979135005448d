use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::time::SystemTime;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::messaging::system_types::SystemMessageType;
use crate::util::buf::{put_string, try_get_string};

pub const UNSET_MESSAGE_ID: i64 = -1;

pub const KEY_SUCCESSFUL: &str = "successful";
pub const KEY_ERROR_MESSAGE: &str = "error_message";

/// A map from keys to ordered lists of string values. This is the payload format of all
///  protocol control messages.
///
/// A key that is absent and a key with an empty list of values are equivalent when reading.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StructuredPayload {
    entries: BTreeMap<String, Vec<String>>,
}

impl Debug for StructuredPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter())
            .finish()
    }
}

impl StructuredPayload {
    pub fn new() -> StructuredPayload {
        Default::default()
    }

    /// a payload carrying the conventional `successful` flag
    pub fn success(successful: bool) -> StructuredPayload {
        StructuredPayload::new()
            .with(KEY_SUCCESSFUL, successful)
    }

    /// a payload signalling failure, with a human readable reason
    pub fn failure(error_message: impl ToString) -> StructuredPayload {
        StructuredPayload::success(false)
            .with(KEY_ERROR_MESSAGE, error_message)
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> StructuredPayload {
        self.put(key, value);
        self
    }

    /// replaces all values for the key
    pub fn put(&mut self, key: &str, value: impl ToString) {
        self.entries.insert(key.to_string(), vec![value.to_string()]);
    }

    /// appends a value to the key's list
    pub fn add(&mut self, key: &str, value: impl ToString) {
        self.entries.entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    pub fn put_all(&mut self, key: &str, values: Vec<String>) {
        self.entries.insert(key.to_string(), values);
    }

    pub fn remove(&mut self, key: &str) -> Vec<String> {
        self.entries.remove(key)
            .unwrap_or_default()
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries.get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_all(key)
            .first()
            .map(|s| s.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_str(key)?
            .parse()
            .ok()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_str(key)?
            .parse()
            .ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys()
            .map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_usize_varint(self.entries.len());
        for (key, values) in &self.entries {
            put_string(buf, key);
            buf.put_usize_varint(values.len());
            for value in values {
                put_string(buf, value);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StructuredPayload> {
        let num_entries = buf.try_get_usize_varint()?;

        let mut entries = BTreeMap::new();
        for _ in 0..num_entries {
            let key = try_get_string(buf)?;
            let num_values = buf.try_get_usize_varint()?;
            if num_values > buf.remaining() {
                // every value takes at least one byte for its length prefix
                bail!("entry {:?} declares {} values, but only {} bytes remain", key, num_values, buf.remaining());
            }

            let mut values = Vec::with_capacity(num_values);
            for _ in 0..num_values {
                values.push(try_get_string(buf)?);
            }
            entries.insert(key, values);
        }

        if buf.has_remaining() {
            bail!("{} trailing bytes after structured payload", buf.remaining());
        }
        Ok(StructuredPayload { entries })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Raw(Bytes),
    Structured(StructuredPayload),
}

impl Payload {
    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Payload::Raw(bytes) => buf.put_slice(bytes),
            Payload::Structured(structured) => structured.ser(buf),
        }
    }
}

impl From<StructuredPayload> for Payload {
    fn from(value: StructuredPayload) -> Self {
        Payload::Structured(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Raw(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(Bytes::from(value))
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Raw(Bytes::copy_from_slice(value))
    }
}

/// The unit of communication between two engines.
///
/// Negative types are reserved for the protocol itself (see [`SystemMessageType`]), so the
///  public constructor rejects them. The payload's encoding (raw bytes vs. structured) is fixed
///  at construction.
#[derive(Clone)]
pub struct Message {
    message_type: i32,
    message_id: i64,
    payload: Payload,
    created_at: SystemTime,
    sent_at: Option<SystemTime>,
    received_at: Option<SystemTime>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Payload::Raw(bytes) => write!(f, "Message{{type:{}, id:{}, raw:{} bytes}}", self.message_type, self.message_id, bytes.len()),
            Payload::Structured(structured) => write!(f, "Message{{type:{}, id:{}, {:?}}}", self.message_type, self.message_id, structured),
        }
    }
}

/// Equality is about what goes over the wire - timestamps are ignored
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message_type == other.message_type &&
            self.message_id == other.message_id &&
            self.payload == other.payload
    }
}
impl Eq for Message {}

impl Message {
    /// Create an application message. Fails for negative (i.e. reserved) types.
    pub fn new(message_type: i32, payload: impl Into<Payload>) -> anyhow::Result<Message> {
        if message_type < 0 {
            bail!("message type {} is reserved for system messages - application messages must have a non-negative type", message_type);
        }
        Ok(Self::with_type(message_type, payload.into()))
    }

    pub fn system(message_type: SystemMessageType, payload: impl Into<Payload>) -> Message {
        Self::with_type(message_type.code(), payload.into())
    }

    /// A system-level acknowledgement for a request, carrying the request's correlation id
    pub fn acknowledgement(request: &Message, payload: StructuredPayload) -> Message {
        Self::system(SystemMessageType::Acknowledgement, payload)
            .with_message_id(request.message_id)
    }

    /// A structured reply of the given type carrying this message's correlation id
    pub fn response_to(&self, message_type: i32, payload: StructuredPayload) -> anyhow::Result<Message> {
        Ok(Self::new(message_type, payload)?
            .with_message_id(self.message_id))
    }

    /// a structured application message signalling failure
    pub fn failure(message_type: i32, error_message: impl ToString) -> anyhow::Result<Message> {
        Self::new(message_type, StructuredPayload::failure(error_message))
    }

    fn with_type(message_type: i32, payload: Payload) -> Message {
        Message {
            message_type,
            message_id: UNSET_MESSAGE_ID,
            payload,
            created_at: SystemTime::now(),
            sent_at: None,
            received_at: None,
        }
    }

    pub(crate) fn received(message_type: i32, message_id: i64, payload: Payload) -> Message {
        let mut message = Self::with_type(message_type, payload);
        message.message_id = message_id;
        message.received_at = Some(SystemTime::now());
        message
    }

    pub fn with_message_id(mut self, message_id: i64) -> Message {
        self.message_id = message_id;
        self
    }

    pub fn message_type(&self) -> i32 {
        self.message_type
    }

    pub fn system_type(&self) -> Option<SystemMessageType> {
        SystemMessageType::try_from(self.message_type).ok()
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn has_message_id(&self) -> bool {
        self.message_id != UNSET_MESSAGE_ID
    }

    pub fn set_message_id(&mut self, message_id: i64) {
        self.message_id = message_id;
    }

    pub fn is_system(&self) -> bool {
        self.message_type < 0
    }

    pub fn is_raw_payload(&self) -> bool {
        self.payload.is_raw()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn raw(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Structured(_) => None,
        }
    }

    pub fn structured(&self) -> Option<&StructuredPayload> {
        match &self.payload {
            Payload::Raw(_) => None,
            Payload::Structured(structured) => Some(structured),
        }
    }

    /// convenience for reading a single value of a structured message - `None` for raw messages
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.structured()?.get_str(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.structured()?.get_i64(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.structured()?.get_bool(key)
    }

    /// Sets the conventional `successful` flag. Fails for raw messages.
    pub fn set_successful(&mut self, successful: bool) -> anyhow::Result<()> {
        match &mut self.payload {
            Payload::Structured(structured) => {
                structured.put(KEY_SUCCESSFUL, successful);
                Ok(())
            }
            Payload::Raw(_) => bail!("raw message {:?} can not carry a success flag", self),
        }
    }

    /// the conventional `successful` flag - absence counts as failure
    pub fn is_successful(&self) -> bool {
        self.get_bool(KEY_SUCCESSFUL).unwrap_or(false)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.get_str(KEY_ERROR_MESSAGE)
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<SystemTime> {
        self.sent_at
    }

    pub fn received_at(&self) -> Option<SystemTime> {
        self.received_at
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent_at = Some(SystemTime::now());
    }
}
