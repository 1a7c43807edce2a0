//! LDAP controls

use bytes::Bytes;

use crate::{
    ber::{self, Packet, TagClass, DEFAULT_MAX_PACKET_SIZE, TAG_SEQUENCE},
    error::Error,
    proto::Control,
};

/// Simple paged result control, OID 1.2.840.113556.1.4.319
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplePagedResultsControl {
    size: u32,
    cookie: Bytes,
    has_entries: bool,
}

impl SimplePagedResultsControl {
    /// Control OID
    pub const OID: &'static str = crate::oid::SIMPLE_PAGED_RESULTS_CONTROL_OID;

    /// Create paged result control with a given page size
    pub fn new(size: u32) -> Self {
        SimplePagedResultsControl {
            size,
            cookie: Bytes::new(),
            has_entries: true,
        }
    }

    /// Replace the page size for a given control
    pub fn with_size(self, size: u32) -> Self {
        SimplePagedResultsControl { size, ..self }
    }

    /// Attach a server-issued cookie; an empty cookie tells the peer the
    /// result set is complete.
    pub fn with_cookie<B: Into<Bytes>>(self, cookie: B) -> Self {
        let cookie = cookie.into();
        SimplePagedResultsControl {
            has_entries: !cookie.is_empty(),
            cookie,
            ..self
        }
    }

    /// Return the server-issued cookie
    pub fn cookie(&self) -> &Bytes {
        &self.cookie
    }

    /// Return the current size
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns true if this control indicates more entries are available
    pub fn has_entries(&self) -> bool {
        self.has_entries
    }
}

impl From<SimplePagedResultsControl> for Control {
    fn from(control: SimplePagedResultsControl) -> Self {
        let value = Packet::sequence(vec![
            Packet::integer(i64::from(control.size)),
            Packet::octet_string(control.cookie),
        ]);
        Control::new(SimplePagedResultsControl::OID, false, Some(ber::encode(&value)))
    }
}

impl TryFrom<Control> for SimplePagedResultsControl {
    type Error = Error;

    fn try_from(control: Control) -> Result<Self, Self::Error> {
        let raw = control.control_value.unwrap_or_default();
        let (packet, _) = ber::decode(&raw, DEFAULT_MAX_PACKET_SIZE)?;
        packet.expect(TagClass::Universal, TAG_SEQUENCE)?;
        let mut parts = packet.into_children()?.into_iter();
        let size = parts
            .next()
            .ok_or(Error::Protocol("missing page size"))?
            .as_i64()?;
        let cookie = parts
            .next()
            .ok_or(Error::Protocol("missing paging cookie"))?
            .payload()?
            .clone();
        let has_entries = !cookie.is_empty();

        Ok(SimplePagedResultsControl {
            size: u32::try_from(size).map_err(|_| Error::Protocol("negative page size"))?,
            cookie,
            has_entries,
        })
    }
}
