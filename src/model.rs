//! Data structures

use bytes::Bytes;

use crate::proto::{PartialAttribute, SearchResultEntry};

/// LDAP attribute definition
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Attribute values
    pub values: Vec<Bytes>,
}

impl Attribute {
    pub fn new<S, I, B>(name: S, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Attribute {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

pub type Attributes = Vec<Attribute>;

impl From<PartialAttribute> for Attribute {
    fn from(raw: PartialAttribute) -> Self {
        Attribute {
            name: raw.name,
            values: raw.values,
        }
    }
}

impl From<Attribute> for PartialAttribute {
    fn from(attr: Attribute) -> Self {
        PartialAttribute {
            name: attr.name,
            values: attr.values,
        }
    }
}

/// An entry found during the search
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchEntry {
    /// The name of the object found (Distinguished Name)
    pub dn: String,
    /// The attributes associated with the object
    pub attributes: Attributes,
}

impl SearchEntry {
    pub fn new<S: Into<String>>(dn: S, attributes: Attributes) -> Self {
        SearchEntry {
            dn: dn.into(),
            attributes,
        }
    }
}

impl From<SearchResultEntry> for SearchEntry {
    fn from(raw: SearchResultEntry) -> Self {
        SearchEntry {
            dn: raw.object_name,
            attributes: raw.attributes.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<SearchEntry> for SearchResultEntry {
    fn from(entry: SearchEntry) -> Self {
        SearchResultEntry {
            object_name: entry.dn,
            attributes: entry.attributes.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything one search produced, in server order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchResult {
    pub entries: Vec<SearchEntry>,
    pub references: Vec<String>,
}
