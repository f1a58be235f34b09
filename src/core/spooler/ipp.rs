// src/core/spooler/ipp.rs

//! Implements the IPP binary message structure and the corresponding
//! `Encoder` and `Decoder` used underneath the HTTP transport.

use crate::core::errors::BridgeError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// Protocol-level limits to prevent runaway allocations from malformed frames.
const MAX_NAME_LEN: usize = 1024;
const MAX_VALUE_LEN: usize = 1024 * 1024;
const MAX_ATTRIBUTES: usize = 64 * 1024;

// --- Operation codes ---
pub const OP_GET_JOB_ATTRIBUTES: u16 = 0x0009;
pub const OP_GET_JOBS: u16 = 0x000A;
pub const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000B;
pub const OP_PAUSE_PRINTER: u16 = 0x0010;
pub const OP_RESUME_PRINTER: u16 = 0x0011;
pub const OP_CREATE_PRINTER_SUBSCRIPTIONS: u16 = 0x0016;
pub const OP_GET_NOTIFICATIONS: u16 = 0x001C;
pub const OP_RENEW_SUBSCRIPTION: u16 = 0x001E;
pub const OP_CANCEL_SUBSCRIPTION: u16 = 0x001F;
pub const OP_CUPS_GET_DEFAULT: u16 = 0x4001;
pub const OP_CUPS_GET_PRINTERS: u16 = 0x4002;
pub const OP_CUPS_ADD_MODIFY_PRINTER: u16 = 0x4003;
pub const OP_CUPS_DELETE_PRINTER: u16 = 0x4004;
pub const OP_CUPS_SET_DEFAULT: u16 = 0x400A;

// --- Status codes ---
pub const STATUS_OK: u16 = 0x0000;
pub const STATUS_NOT_FOUND: u16 = 0x0406;
pub const STATUS_NOT_POSSIBLE: u16 = 0x0504;

// --- Delimiter tags ---
pub const TAG_OPERATION: u8 = 0x01;
pub const TAG_JOB: u8 = 0x02;
pub const TAG_END: u8 = 0x03;
pub const TAG_PRINTER: u8 = 0x04;
pub const TAG_UNSUPPORTED_GROUP: u8 = 0x05;
pub const TAG_SUBSCRIPTION: u8 = 0x06;
pub const TAG_EVENT_NOTIFICATION: u8 = 0x07;

// --- Value tags ---
const VT_NO_VALUE: u8 = 0x13;
const VT_INTEGER: u8 = 0x21;
const VT_BOOLEAN: u8 = 0x22;
const VT_ENUM: u8 = 0x23;
const VT_OCTET_STRING: u8 = 0x30;
const VT_DATE_TIME: u8 = 0x31;
const VT_RESOLUTION: u8 = 0x32;
const VT_RANGE: u8 = 0x33;
const VT_BEG_COLLECTION: u8 = 0x34;
const VT_END_COLLECTION: u8 = 0x37;
const VT_TEXT: u8 = 0x41;
const VT_NAME: u8 = 0x42;
const VT_KEYWORD: u8 = 0x44;
const VT_URI: u8 = 0x45;
const VT_URI_SCHEME: u8 = 0x46;
const VT_CHARSET: u8 = 0x47;
const VT_NATURAL_LANGUAGE: u8 = 0x48;
const VT_MIME_MEDIA_TYPE: u8 = 0x49;
const VT_MEMBER_ATTR_NAME: u8 = 0x4A;

/// One attribute value on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum IppValue {
    Integer(i32),
    Boolean(bool),
    Enum(i32),
    OctetString(Bytes),
    /// Eleven opaque bytes; the daemon never interprets timestamps.
    DateTime(Bytes),
    Resolution { x: i32, y: i32, units: i8 },
    RangeOfInteger { lower: i32, upper: i32 },
    Collection(Vec<(String, IppValue)>),
    Text(String),
    Name(String),
    Keyword(String),
    Uri(String),
    UriScheme(String),
    Charset(String),
    NaturalLanguage(String),
    MimeMediaType(String),
    NoValue,
    /// A tag this daemon has no use for; carried opaquely.
    Other(u8, Bytes),
}

impl IppValue {
    /// The textual form, for string-flavoured values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            IppValue::Text(s)
            | IppValue::Name(s)
            | IppValue::Keyword(s)
            | IppValue::Uri(s)
            | IppValue::UriScheme(s)
            | IppValue::Charset(s)
            | IppValue::NaturalLanguage(s)
            | IppValue::MimeMediaType(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            IppValue::Integer(v) | IppValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            IppValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            IppValue::Integer(_) => VT_INTEGER,
            IppValue::Boolean(_) => VT_BOOLEAN,
            IppValue::Enum(_) => VT_ENUM,
            IppValue::OctetString(_) => VT_OCTET_STRING,
            IppValue::DateTime(_) => VT_DATE_TIME,
            IppValue::Resolution { .. } => VT_RESOLUTION,
            IppValue::RangeOfInteger { .. } => VT_RANGE,
            IppValue::Collection(_) => VT_BEG_COLLECTION,
            IppValue::Text(_) => VT_TEXT,
            IppValue::Name(_) => VT_NAME,
            IppValue::Keyword(_) => VT_KEYWORD,
            IppValue::Uri(_) => VT_URI,
            IppValue::UriScheme(_) => VT_URI_SCHEME,
            IppValue::Charset(_) => VT_CHARSET,
            IppValue::NaturalLanguage(_) => VT_NATURAL_LANGUAGE,
            IppValue::MimeMediaType(_) => VT_MIME_MEDIA_TYPE,
            IppValue::NoValue => VT_NO_VALUE,
            IppValue::Other(tag, _) => *tag,
        }
    }
}

/// One named attribute with one or more values.
#[derive(Debug, Clone, PartialEq)]
pub struct IppAttribute {
    pub name: String,
    pub values: Vec<IppValue>,
}

impl IppAttribute {
    pub fn new(name: &str, value: IppValue) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value],
        }
    }

    pub fn with_values(name: &str, values: Vec<IppValue>) -> Self {
        Self {
            name: name.to_string(),
            values,
        }
    }

    pub fn first_str(&self) -> Option<&str> {
        self.values.first().and_then(|v| v.as_str())
    }

    pub fn first_i32(&self) -> Option<i32> {
        self.values.first().and_then(|v| v.as_i32())
    }

    pub fn first_bool(&self) -> Option<bool> {
        self.values.first().and_then(|v| v.as_bool())
    }

    pub fn strings(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|v| v.as_str())
    }

    pub fn integers(&self) -> impl Iterator<Item = i32> + '_ {
        self.values.iter().filter_map(|v| v.as_i32())
    }
}

/// One attribute group with its delimiter tag.
#[derive(Debug, Clone, PartialEq)]
pub struct IppGroup {
    pub tag: u8,
    pub attributes: Vec<IppAttribute>,
}

impl IppGroup {
    pub fn new(tag: u8) -> Self {
        Self {
            tag,
            attributes: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&IppAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// A complete IPP request or response.
#[derive(Debug, Clone, PartialEq)]
pub struct IppMessage {
    pub version_major: u8,
    pub version_minor: u8,
    /// Operation code on requests, status code on responses.
    pub operation_or_status: u16,
    pub request_id: u32,
    pub groups: Vec<IppGroup>,
}

impl IppMessage {
    /// Starts a request with the mandatory charset and natural-language
    /// operation attributes already in place.
    pub fn request(operation: u16, request_id: u32) -> Self {
        let mut operation_group = IppGroup::new(TAG_OPERATION);
        operation_group
            .attributes
            .push(IppAttribute::new("attributes-charset", IppValue::Charset("utf-8".into())));
        operation_group.attributes.push(IppAttribute::new(
            "attributes-natural-language",
            IppValue::NaturalLanguage("en".into()),
        ));
        Self {
            version_major: 2,
            version_minor: 0,
            operation_or_status: operation,
            request_id,
            groups: vec![operation_group],
        }
    }

    /// Appends an attribute to the operation group.
    pub fn operation_attr(mut self, attr: IppAttribute) -> Self {
        self.groups
            .first_mut()
            .expect("request always has an operation group")
            .attributes
            .push(attr);
        self
    }

    /// Appends a whole non-operation group.
    pub fn group(mut self, group: IppGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// On a response: whether the status code reports success.
    pub fn is_success(&self) -> bool {
        self.operation_or_status < 0x0100
    }

    /// The status message attribute, when the spooler sent one.
    pub fn status_message(&self) -> Option<&str> {
        self.first_group(TAG_OPERATION)
            .and_then(|g| g.attr("status-message"))
            .and_then(|a| a.first_str())
    }

    pub fn first_group(&self, tag: u8) -> Option<&IppGroup> {
        self.groups.iter().find(|g| g.tag == tag)
    }

    pub fn groups_of(&self, tag: u8) -> impl Iterator<Item = &IppGroup> {
        self.groups.iter().filter(move |g| g.tag == tag)
    }

    /// Convenience encoder producing the complete on-wire form.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, BridgeError> {
        let mut buf = BytesMut::new();
        IppCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding IPP
/// messages.
#[derive(Debug, Default)]
pub struct IppCodec;

impl Encoder<IppMessage> for IppCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: IppMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(item.version_major);
        dst.put_u8(item.version_minor);
        dst.put_u16(item.operation_or_status);
        dst.put_u32(item.request_id);

        for group in &item.groups {
            dst.put_u8(group.tag);
            for attribute in &group.attributes {
                encode_attribute(attribute, dst)?;
            }
        }
        dst.put_u8(TAG_END);
        Ok(())
    }
}

fn put_len_prefixed(dst: &mut BytesMut, data: &[u8]) -> Result<(), BridgeError> {
    if data.len() > u16::MAX as usize {
        return Err(BridgeError::Protocol("attribute field too long".into()));
    }
    dst.put_u16(data.len() as u16);
    dst.put_slice(data);
    Ok(())
}

fn encode_attribute(attribute: &IppAttribute, dst: &mut BytesMut) -> Result<(), BridgeError> {
    for (i, value) in attribute.values.iter().enumerate() {
        // Only the first value carries the attribute name; additional values
        // repeat the tag with an empty name.
        let name: &[u8] = if i == 0 {
            attribute.name.as_bytes()
        } else {
            b""
        };
        encode_value(value, name, dst)?;
    }
    Ok(())
}

fn encode_value(value: &IppValue, name: &[u8], dst: &mut BytesMut) -> Result<(), BridgeError> {
    dst.put_u8(value.tag());
    put_len_prefixed(dst, name)?;

    match value {
        IppValue::Integer(v) | IppValue::Enum(v) => {
            dst.put_u16(4);
            dst.put_i32(*v);
        }
        IppValue::Boolean(v) => {
            dst.put_u16(1);
            dst.put_u8(u8::from(*v));
        }
        IppValue::OctetString(b) | IppValue::DateTime(b) | IppValue::Other(_, b) => {
            put_len_prefixed(dst, b)?;
        }
        IppValue::Resolution { x, y, units } => {
            dst.put_u16(9);
            dst.put_i32(*x);
            dst.put_i32(*y);
            dst.put_i8(*units);
        }
        IppValue::RangeOfInteger { lower, upper } => {
            dst.put_u16(8);
            dst.put_i32(*lower);
            dst.put_i32(*upper);
        }
        IppValue::Collection(members) => {
            // begCollection has an empty value; members follow as
            // memberAttrName/value pairs, closed by endCollection.
            dst.put_u16(0);
            for (member_name, member_value) in members {
                dst.put_u8(VT_MEMBER_ATTR_NAME);
                dst.put_u16(0);
                put_len_prefixed(dst, member_name.as_bytes())?;
                encode_value(member_value, b"", dst)?;
            }
            dst.put_u8(VT_END_COLLECTION);
            dst.put_u16(0);
            dst.put_u16(0);
        }
        IppValue::Text(s)
        | IppValue::Name(s)
        | IppValue::Keyword(s)
        | IppValue::Uri(s)
        | IppValue::UriScheme(s)
        | IppValue::Charset(s)
        | IppValue::NaturalLanguage(s)
        | IppValue::MimeMediaType(s) => {
            put_len_prefixed(dst, s.as_bytes())?;
        }
        IppValue::NoValue => {
            dst.put_u16(0);
        }
    }
    Ok(())
}

impl Decoder for IppCodec {
    type Item = IppMessage;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(src);
        match parse_message(&mut cursor) {
            Ok(message) => {
                let consumed = cursor.position;
                src.advance(consumed);
                Ok(Some(message))
            }
            Err(BridgeError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// A non-consuming read position over the receive buffer, so incomplete
/// messages leave it untouched.
struct Cursor<'a> {
    buf: &'a BytesMut,
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a BytesMut) -> Self {
        Self { buf, position: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.position
    }

    fn read_u8(&mut self) -> Result<u8, BridgeError> {
        if self.remaining() < 1 {
            return Err(BridgeError::IncompleteData);
        }
        let b = self.buf[self.position];
        self.position += 1;
        Ok(b)
    }

    fn peek_u8(&self) -> Result<u8, BridgeError> {
        if self.remaining() < 1 {
            return Err(BridgeError::IncompleteData);
        }
        Ok(self.buf[self.position])
    }

    fn read_u16(&mut self) -> Result<u16, BridgeError> {
        if self.remaining() < 2 {
            return Err(BridgeError::IncompleteData);
        }
        let v = u16::from_be_bytes([self.buf[self.position], self.buf[self.position + 1]]);
        self.position += 2;
        Ok(v)
    }

    fn read_i32(&mut self) -> Result<i32, BridgeError> {
        if self.remaining() < 4 {
            return Err(BridgeError::IncompleteData);
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.position..self.position + 4]);
        self.position += 4;
        Ok(i32::from_be_bytes(raw))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes, BridgeError> {
        if self.remaining() < len {
            return Err(BridgeError::IncompleteData);
        }
        let out = Bytes::copy_from_slice(&self.buf[self.position..self.position + len]);
        self.position += len;
        Ok(out)
    }

    fn read_string(&mut self, len: usize, max: usize) -> Result<String, BridgeError> {
        if len > max {
            return Err(BridgeError::Protocol(format!(
                "field of {len} bytes exceeds limit"
            )));
        }
        let raw = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

fn parse_message(cursor: &mut Cursor<'_>) -> Result<IppMessage, BridgeError> {
    let version_major = cursor.read_u8()?;
    let version_minor = cursor.read_u8()?;
    let operation_or_status = cursor.read_u16()?;
    let request_id = cursor.read_i32()? as u32;

    let mut groups: Vec<IppGroup> = Vec::new();
    let mut total_attributes = 0usize;

    loop {
        let tag = cursor.read_u8()?;
        if tag == TAG_END {
            break;
        }
        if !(0x01..0x10).contains(&tag) {
            return Err(BridgeError::Protocol(format!(
                "expected delimiter tag, got 0x{tag:02x}"
            )));
        }

        let mut group = IppGroup::new(tag);
        loop {
            let next = cursor.peek_u8()?;
            if (0x01..0x10).contains(&next) {
                break;
            }
            let attribute = parse_attribute(cursor, &mut group)?;
            if let Some(attribute) = attribute {
                group.attributes.push(attribute);
            }
            total_attributes += 1;
            if total_attributes > MAX_ATTRIBUTES {
                return Err(BridgeError::Protocol("too many attributes".into()));
            }
        }
        groups.push(group);
    }

    Ok(IppMessage {
        version_major,
        version_minor,
        operation_or_status,
        request_id,
        groups,
    })
}

/// Parses one value. Returns `None` when the value continued the previous
/// attribute (empty name) and was appended to it instead.
fn parse_attribute(
    cursor: &mut Cursor<'_>,
    group: &mut IppGroup,
) -> Result<Option<IppAttribute>, BridgeError> {
    let tag = cursor.read_u8()?;
    let name_len = cursor.read_u16()? as usize;
    let name = cursor.read_string(name_len, MAX_NAME_LEN)?;
    let value = parse_value(cursor, tag)?;

    if name.is_empty() {
        match group.attributes.last_mut() {
            Some(previous) => {
                previous.values.push(value);
                Ok(None)
            }
            None => Err(BridgeError::Protocol(
                "continuation value without an attribute".into(),
            )),
        }
    } else {
        Ok(Some(IppAttribute {
            name,
            values: vec![value],
        }))
    }
}

fn parse_value(cursor: &mut Cursor<'_>, tag: u8) -> Result<IppValue, BridgeError> {
    if tag == VT_BEG_COLLECTION {
        let value_len = cursor.read_u16()? as usize;
        cursor.read_bytes(value_len)?;
        return parse_collection(cursor);
    }

    let value_len = cursor.read_u16()? as usize;
    if value_len > MAX_VALUE_LEN {
        return Err(BridgeError::Protocol(format!(
            "value of {value_len} bytes exceeds limit"
        )));
    }

    Ok(match tag {
        VT_INTEGER => {
            expect_len(value_len, 4)?;
            IppValue::Integer(cursor.read_i32()?)
        }
        VT_ENUM => {
            expect_len(value_len, 4)?;
            IppValue::Enum(cursor.read_i32()?)
        }
        VT_BOOLEAN => {
            expect_len(value_len, 1)?;
            IppValue::Boolean(cursor.read_u8()? != 0)
        }
        VT_RESOLUTION => {
            expect_len(value_len, 9)?;
            let x = cursor.read_i32()?;
            let y = cursor.read_i32()?;
            let units = cursor.read_u8()? as i8;
            IppValue::Resolution { x, y, units }
        }
        VT_RANGE => {
            expect_len(value_len, 8)?;
            let lower = cursor.read_i32()?;
            let upper = cursor.read_i32()?;
            IppValue::RangeOfInteger { lower, upper }
        }
        VT_OCTET_STRING => IppValue::OctetString(cursor.read_bytes(value_len)?),
        VT_DATE_TIME => IppValue::DateTime(cursor.read_bytes(value_len)?),
        VT_NO_VALUE => {
            cursor.read_bytes(value_len)?;
            IppValue::NoValue
        }
        VT_TEXT => IppValue::Text(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_NAME => IppValue::Name(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_KEYWORD => IppValue::Keyword(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_URI => IppValue::Uri(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_URI_SCHEME => IppValue::UriScheme(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_CHARSET => IppValue::Charset(cursor.read_string(value_len, MAX_VALUE_LEN)?),
        VT_NATURAL_LANGUAGE => {
            IppValue::NaturalLanguage(cursor.read_string(value_len, MAX_VALUE_LEN)?)
        }
        VT_MIME_MEDIA_TYPE => {
            IppValue::MimeMediaType(cursor.read_string(value_len, MAX_VALUE_LEN)?)
        }
        other => IppValue::Other(other, cursor.read_bytes(value_len)?),
    })
}

fn parse_collection(cursor: &mut Cursor<'_>) -> Result<IppValue, BridgeError> {
    let mut members = Vec::new();
    loop {
        let tag = cursor.read_u8()?;
        if tag == VT_END_COLLECTION {
            let name_len = cursor.read_u16()? as usize;
            cursor.read_bytes(name_len)?;
            let value_len = cursor.read_u16()? as usize;
            cursor.read_bytes(value_len)?;
            return Ok(IppValue::Collection(members));
        }
        if tag != VT_MEMBER_ATTR_NAME {
            return Err(BridgeError::Protocol(format!(
                "expected memberAttrName in collection, got 0x{tag:02x}"
            )));
        }
        // memberAttrName: empty name, member name as value.
        let name_len = cursor.read_u16()? as usize;
        cursor.read_bytes(name_len)?;
        let member_name_len = cursor.read_u16()? as usize;
        let member_name = cursor.read_string(member_name_len, MAX_NAME_LEN)?;

        // The member's value follows with an empty attribute name.
        let value_tag = cursor.read_u8()?;
        let value_name_len = cursor.read_u16()? as usize;
        cursor.read_bytes(value_name_len)?;
        let value = parse_value(cursor, value_tag)?;
        members.push((member_name, value));
        if members.len() > MAX_ATTRIBUTES {
            return Err(BridgeError::Protocol("collection too large".into()));
        }
    }
}

fn expect_len(actual: usize, expected: usize) -> Result<(), BridgeError> {
    if actual != expected {
        return Err(BridgeError::Protocol(format!(
            "value length {actual}, expected {expected}"
        )));
    }
    Ok(())
}
