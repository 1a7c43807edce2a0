//! Typed LDAP protocol messages (RFC 4511) and their packet conversions.

use std::{fmt, iter::Peekable, vec};

use bytes::Bytes;

use crate::{
    ber::{Packet, TagClass, TAG_BOOLEAN, TAG_SEQUENCE, TAG_SET},
    error::Error,
};

const TAG_BIND_REQUEST: u32 = 0;
const TAG_BIND_RESPONSE: u32 = 1;
const TAG_UNBIND_REQUEST: u32 = 2;
const TAG_SEARCH_REQUEST: u32 = 3;
const TAG_SEARCH_RESULT_ENTRY: u32 = 4;
const TAG_SEARCH_RESULT_DONE: u32 = 5;
const TAG_MODIFY_REQUEST: u32 = 6;
const TAG_MODIFY_RESPONSE: u32 = 7;
const TAG_ADD_REQUEST: u32 = 8;
const TAG_ADD_RESPONSE: u32 = 9;
const TAG_DEL_REQUEST: u32 = 10;
const TAG_DEL_RESPONSE: u32 = 11;
const TAG_MODIFY_DN_REQUEST: u32 = 12;
const TAG_MODIFY_DN_RESPONSE: u32 = 13;
const TAG_COMPARE_REQUEST: u32 = 14;
const TAG_COMPARE_RESPONSE: u32 = 15;
const TAG_ABANDON_REQUEST: u32 = 16;
const TAG_SEARCH_RESULT_REFERENCE: u32 = 19;
const TAG_EXTENDED_REQUEST: u32 = 23;
const TAG_EXTENDED_RESPONSE: u32 = 24;

type Parts = Peekable<vec::IntoIter<Packet>>;

fn take(parts: &mut Parts, what: &'static str) -> Result<Packet, Error> {
    parts.next().ok_or(Error::Protocol(what))
}

/// LDAP result codes (RFC 4511 §4.1.9). Codes outside the standard table
/// decode as [`ResultCode::Other`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
}

impl ResultCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::AliasDereferencingProblem => 36,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
        }
    }

    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            20 => ResultCode::AttributeOrValueExists,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            36 => ResultCode::AliasDereferencingProblem,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            64 => ResultCode::NamingViolation,
            65 => ResultCode::ObjectClassViolation,
            66 => ResultCode::NotAllowedOnNonLeaf,
            67 => ResultCode::NotAllowedOnRdn,
            68 => ResultCode::EntryAlreadyExists,
            69 => ResultCode::ObjectClassModsProhibited,
            71 => ResultCode::AffectsMultipleDsas,
            _ => ResultCode::Other,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ResultCode::Success => "Success",
            ResultCode::OperationsError => "Operations Error",
            ResultCode::ProtocolError => "Protocol Error",
            ResultCode::TimeLimitExceeded => "Time Limit Exceeded",
            ResultCode::SizeLimitExceeded => "Size Limit Exceeded",
            ResultCode::CompareFalse => "Compare False",
            ResultCode::CompareTrue => "Compare True",
            ResultCode::AuthMethodNotSupported => "Auth Method Not Supported",
            ResultCode::StrongerAuthRequired => "Stronger Auth Required",
            ResultCode::Referral => "Referral",
            ResultCode::AdminLimitExceeded => "Admin Limit Exceeded",
            ResultCode::UnavailableCriticalExtension => "Unavailable Critical Extension",
            ResultCode::ConfidentialityRequired => "Confidentiality Required",
            ResultCode::SaslBindInProgress => "SASL Bind In Progress",
            ResultCode::NoSuchAttribute => "No Such Attribute",
            ResultCode::UndefinedAttributeType => "Undefined Attribute Type",
            ResultCode::InappropriateMatching => "Inappropriate Matching",
            ResultCode::ConstraintViolation => "Constraint Violation",
            ResultCode::AttributeOrValueExists => "Attribute Or Value Exists",
            ResultCode::InvalidAttributeSyntax => "Invalid Attribute Syntax",
            ResultCode::NoSuchObject => "No Such Object",
            ResultCode::AliasProblem => "Alias Problem",
            ResultCode::InvalidDnSyntax => "Invalid DN Syntax",
            ResultCode::AliasDereferencingProblem => "Alias Dereferencing Problem",
            ResultCode::InappropriateAuthentication => "Inappropriate Authentication",
            ResultCode::InvalidCredentials => "Invalid Credentials",
            ResultCode::InsufficientAccessRights => "Insufficient Access Rights",
            ResultCode::Busy => "Busy",
            ResultCode::Unavailable => "Unavailable",
            ResultCode::UnwillingToPerform => "Unwilling To Perform",
            ResultCode::LoopDetect => "Loop Detect",
            ResultCode::NamingViolation => "Naming Violation",
            ResultCode::ObjectClassViolation => "Object Class Violation",
            ResultCode::NotAllowedOnNonLeaf => "Not Allowed On Non Leaf",
            ResultCode::NotAllowedOnRdn => "Not Allowed On RDN",
            ResultCode::EntryAlreadyExists => "Entry Already Exists",
            ResultCode::ObjectClassModsProhibited => "Object Class Mods Prohibited",
            ResultCode::AffectsMultipleDsas => "Affects Multiple DSAs",
            ResultCode::Other => "Other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u32())
    }
}

/// The standard result envelope shared by most responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referral: Option<Vec<String>>,
}

impl LdapResult {
    pub fn new<D, M>(result_code: ResultCode, matched_dn: D, diagnostic_message: M) -> Self
    where
        D: Into<String>,
        M: Into<String>,
    {
        LdapResult {
            result_code,
            matched_dn: matched_dn.into(),
            diagnostic_message: diagnostic_message.into(),
            referral: None,
        }
    }

    fn write_fields(&self, out: &mut Vec<Packet>) {
        out.push(Packet::enumerated(i64::from(self.result_code.as_u32())));
        out.push(Packet::octet_string(self.matched_dn.clone()));
        out.push(Packet::octet_string(self.diagnostic_message.clone()));
        if let Some(urls) = &self.referral {
            out.push(Packet::context(
                3,
                urls.iter().map(|u| Packet::octet_string(u.clone())).collect(),
            ));
        }
    }

    fn read_fields(parts: &mut Parts) -> Result<Self, Error> {
        let code = take(parts, "missing result code")?.as_i64()?;
        let matched_dn = take(parts, "missing matched DN")?.as_string()?;
        let diagnostic_message = take(parts, "missing diagnostic message")?.as_string()?;
        let has_referral = matches!(parts.peek(), Some(p) if p.is(TagClass::Context, 3));
        let referral = if has_referral {
            Some(
                take(parts, "referral")?
                    .into_children()?
                    .into_iter()
                    .map(|p| p.as_string().map_err(Error::from))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        } else {
            None
        };
        Ok(LdapResult {
            result_code: ResultCode::from_u32(u32::try_from(code).map_err(|_| Error::Protocol("negative result code"))?),
            matched_dn,
            diagnostic_message,
            referral,
        })
    }
}

/// A request or response control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub control_value: Option<Bytes>,
}

impl Control {
    pub fn new<S: Into<String>>(control_type: S, criticality: bool, control_value: Option<Bytes>) -> Self {
        Control {
            control_type: control_type.into(),
            criticality,
            control_value,
        }
    }

    fn to_packet(&self) -> Packet {
        let mut children = vec![Packet::octet_string(self.control_type.clone())];
        if self.criticality {
            children.push(Packet::boolean(true));
        }
        if let Some(value) = &self.control_value {
            children.push(Packet::octet_string(value.clone()));
        }
        Packet::sequence(children)
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let control_type = take(&mut parts, "missing control type")?.as_string()?;
        let mut criticality = false;
        if matches!(parts.peek(), Some(p) if p.is(TagClass::Universal, TAG_BOOLEAN)) {
            criticality = take(&mut parts, "criticality")?.as_bool()?;
        }
        let control_value = match parts.next() {
            Some(p) => Some(p.payload()?.clone()),
            None => None,
        };
        Ok(Control {
            control_type,
            criticality,
            control_value,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

impl SearchScope {
    fn as_i64(self) -> i64 {
        match self {
            SearchScope::BaseObject => 0,
            SearchScope::SingleLevel => 1,
            SearchScope::WholeSubtree => 2,
        }
    }

    fn from_i64(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(Error::Protocol("invalid search scope")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerefAliases {
    Never,
    InSearching,
    FindingBase,
    Always,
}

impl DerefAliases {
    fn as_i64(self) -> i64 {
        match self {
            DerefAliases::Never => 0,
            DerefAliases::InSearching => 1,
            DerefAliases::FindingBase => 2,
            DerefAliases::Always => 3,
        }
    }

    fn from_i64(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBase),
            3 => Ok(DerefAliases::Always),
            _ => Err(Error::Protocol("invalid deref aliases value")),
        }
    }
}

/// RFC 4515 filter tree. Wire form is the context-tagged CHOICE inside a
/// search request; string form lives in [`crate::filter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attribute: String, value: Bytes },
    Substrings { attribute: String, parts: Vec<SubstringPart> },
    GreaterOrEqual { attribute: String, value: Bytes },
    LessOrEqual { attribute: String, value: Bytes },
    Present(String),
    ApproxMatch { attribute: String, value: Bytes },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Bytes,
        dn_attributes: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubstringPart {
    Initial(Bytes),
    Any(Bytes),
    Final(Bytes),
}

fn ava_packet(tag: u32, attribute: &str, value: &Bytes) -> Packet {
    Packet::context(
        tag,
        vec![Packet::octet_string(attribute.to_owned()), Packet::octet_string(value.clone())],
    )
}

fn ava_from_parts(packet: Packet) -> Result<(String, Bytes), Error> {
    let mut parts = packet.into_children()?.into_iter().peekable();
    let attribute = take(&mut parts, "missing assertion attribute")?.as_string()?;
    let value = take(&mut parts, "missing assertion value")?.payload()?.clone();
    Ok((attribute, value))
}

impl Filter {
    pub(crate) fn to_packet(&self) -> Packet {
        match self {
            Filter::And(children) => Packet::context(0, children.iter().map(Filter::to_packet).collect()),
            Filter::Or(children) => Packet::context(1, children.iter().map(Filter::to_packet).collect()),
            Filter::Not(child) => Packet::context(2, vec![child.to_packet()]),
            Filter::EqualityMatch { attribute, value } => ava_packet(3, attribute, value),
            Filter::Substrings { attribute, parts } => {
                let parts = parts
                    .iter()
                    .map(|part| match part {
                        SubstringPart::Initial(v) => Packet::context_primitive(0, v.clone()),
                        SubstringPart::Any(v) => Packet::context_primitive(1, v.clone()),
                        SubstringPart::Final(v) => Packet::context_primitive(2, v.clone()),
                    })
                    .collect();
                Packet::context(
                    4,
                    vec![Packet::octet_string(attribute.clone()), Packet::sequence(parts)],
                )
            }
            Filter::GreaterOrEqual { attribute, value } => ava_packet(5, attribute, value),
            Filter::LessOrEqual { attribute, value } => ava_packet(6, attribute, value),
            Filter::Present(attribute) => Packet::context_primitive(7, attribute.clone()),
            Filter::ApproxMatch { attribute, value } => ava_packet(8, attribute, value),
            Filter::ExtensibleMatch {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                let mut children = Vec::new();
                if let Some(rule) = matching_rule {
                    children.push(Packet::context_primitive(1, rule.clone()));
                }
                if let Some(attribute) = attribute {
                    children.push(Packet::context_primitive(2, attribute.clone()));
                }
                children.push(Packet::context_primitive(3, value.clone()));
                if *dn_attributes {
                    children.push(Packet::context_primitive(4, vec![0xffu8]));
                }
                Packet::context(9, children)
            }
        }
    }

    pub(crate) fn from_packet(packet: Packet) -> Result<Self, Error> {
        if packet.class != TagClass::Context {
            return Err(Error::Protocol("filter is not context-tagged"));
        }
        match packet.tag {
            0 | 1 => {
                let and = packet.tag == 0;
                let children = packet
                    .into_children()?
                    .into_iter()
                    .map(Filter::from_packet)
                    .collect::<Result<Vec<_>, _>>()?;
                if children.is_empty() {
                    return Err(Error::Protocol("empty and/or filter"));
                }
                Ok(if and { Filter::And(children) } else { Filter::Or(children) })
            }
            2 => {
                let mut children = packet.into_children()?;
                if children.len() != 1 {
                    return Err(Error::Protocol("not filter must carry exactly one child"));
                }
                Ok(Filter::Not(Box::new(Filter::from_packet(children.remove(0))?)))
            }
            3 => {
                let (attribute, value) = ava_from_parts(packet)?;
                Ok(Filter::EqualityMatch { attribute, value })
            }
            4 => {
                let mut fields = packet.into_children()?.into_iter().peekable();
                let attribute = take(&mut fields, "missing substring attribute")?.as_string()?;
                let parts = take(&mut fields, "missing substring sequence")?
                    .into_children()?
                    .into_iter()
                    .map(|p| {
                        let tag = p.tag;
                        let value = p.payload()?.clone();
                        match tag {
                            0 => Ok(SubstringPart::Initial(value)),
                            1 => Ok(SubstringPart::Any(value)),
                            2 => Ok(SubstringPart::Final(value)),
                            _ => Err(Error::Protocol("invalid substring choice")),
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Filter::Substrings { attribute, parts })
            }
            5 => {
                let (attribute, value) = ava_from_parts(packet)?;
                Ok(Filter::GreaterOrEqual { attribute, value })
            }
            6 => {
                let (attribute, value) = ava_from_parts(packet)?;
                Ok(Filter::LessOrEqual { attribute, value })
            }
            7 => Ok(Filter::Present(packet.as_string()?)),
            8 => {
                let (attribute, value) = ava_from_parts(packet)?;
                Ok(Filter::ApproxMatch { attribute, value })
            }
            9 => {
                let mut matching_rule = None;
                let mut attribute = None;
                let mut value = None;
                let mut dn_attributes = false;
                for field in packet.into_children()? {
                    match field.tag {
                        1 => matching_rule = Some(field.as_string()?),
                        2 => attribute = Some(field.as_string()?),
                        3 => value = Some(field.payload()?.clone()),
                        4 => dn_attributes = field.as_bool()?,
                        _ => return Err(Error::Protocol("invalid extensible match field")),
                    }
                }
                Ok(Filter::ExtensibleMatch {
                    matching_rule,
                    attribute,
                    value: value.ok_or(Error::Protocol("extensible match without value"))?,
                    dn_attributes,
                })
            }
            _ => Err(Error::Protocol("unknown filter choice")),
        }
    }
}

/// One attribute with its values, in wire order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialAttribute {
    pub name: String,
    pub values: Vec<Bytes>,
}

impl PartialAttribute {
    pub fn new<S, I, B>(name: S, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        PartialAttribute {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn to_packet(&self) -> Packet {
        Packet::sequence(vec![
            Packet::octet_string(self.name.clone()),
            Packet::set(self.values.iter().map(|v| Packet::octet_string(v.clone())).collect()),
        ])
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let name = take(&mut parts, "missing attribute name")?.as_string()?;
        let values_packet = take(&mut parts, "missing attribute values")?;
        if !values_packet.is(TagClass::Universal, TAG_SET) && !values_packet.is(TagClass::Universal, TAG_SEQUENCE) {
            return Err(Error::Protocol("attribute values must be a SET"));
        }
        let values = values_packet
            .into_children()?
            .into_iter()
            .map(|p| p.payload().cloned().map_err(Error::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PartialAttribute { name, values })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Authentication {
    Simple(Bytes),
    Sasl { mechanism: String, credentials: Option<Bytes> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: Authentication,
}

impl BindRequest {
    /// Simple bind; `("", "")` is the anonymous bind.
    pub fn simple<N, P>(name: N, password: P) -> Self
    where
        N: Into<String>,
        P: Into<Bytes>,
    {
        BindRequest {
            version: 3,
            name: name.into(),
            authentication: Authentication::Simple(password.into()),
        }
    }

    fn to_packet(&self) -> Packet {
        let auth = match &self.authentication {
            Authentication::Simple(password) => Packet::context_primitive(0, password.clone()),
            Authentication::Sasl { mechanism, credentials } => {
                let mut children = vec![Packet::octet_string(mechanism.clone())];
                if let Some(credentials) = credentials {
                    children.push(Packet::octet_string(credentials.clone()));
                }
                Packet::context(3, children)
            }
        };
        Packet::application(
            TAG_BIND_REQUEST,
            vec![
                Packet::integer(i64::from(self.version)),
                Packet::octet_string(self.name.clone()),
                auth,
            ],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let version = take(&mut parts, "missing bind version")?.as_i64()?;
        let name = take(&mut parts, "missing bind name")?.as_string()?;
        let auth = take(&mut parts, "missing bind authentication")?;
        let authentication = match (auth.class, auth.tag) {
            (TagClass::Context, 0) => Authentication::Simple(auth.payload()?.clone()),
            (TagClass::Context, 3) => {
                let mut fields = auth.into_children()?.into_iter().peekable();
                let mechanism = take(&mut fields, "missing SASL mechanism")?.as_string()?;
                let credentials = match fields.next() {
                    Some(p) => Some(p.payload()?.clone()),
                    None => None,
                };
                Authentication::Sasl { mechanism, credentials }
            }
            _ => return Err(Error::Protocol("unknown bind authentication choice")),
        };
        Ok(BindRequest {
            version: i32::try_from(version).map_err(|_| Error::Protocol("bind version out of range"))?,
            name,
            authentication,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Bytes>,
}

impl BindResponse {
    fn to_packet(&self) -> Packet {
        let mut children = Vec::new();
        self.result.write_fields(&mut children);
        if let Some(creds) = &self.server_sasl_creds {
            children.push(Packet::context_primitive(7, creds.clone()));
        }
        Packet::application(TAG_BIND_RESPONSE, children)
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let result = LdapResult::read_fields(&mut parts)?;
        let server_sasl_creds = match parts.next() {
            Some(p) => Some(p.payload()?.clone()),
            None => None,
        };
        Ok(BindResponse { result, server_sasl_creds })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    fn to_packet(&self) -> Packet {
        Packet::application(
            TAG_SEARCH_REQUEST,
            vec![
                Packet::octet_string(self.base_dn.clone()),
                Packet::enumerated(self.scope.as_i64()),
                Packet::enumerated(self.deref_aliases.as_i64()),
                Packet::integer(i64::from(self.size_limit)),
                Packet::integer(i64::from(self.time_limit)),
                Packet::boolean(self.types_only),
                self.filter.to_packet(),
                Packet::sequence(self.attributes.iter().map(|a| Packet::octet_string(a.clone())).collect()),
            ],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let base_dn = take(&mut parts, "missing search base")?.as_string()?;
        let scope = SearchScope::from_i64(take(&mut parts, "missing search scope")?.as_i64()?)?;
        let deref_aliases = DerefAliases::from_i64(take(&mut parts, "missing deref aliases")?.as_i64()?)?;
        let size_limit = take(&mut parts, "missing size limit")?.as_i64()?;
        let time_limit = take(&mut parts, "missing time limit")?.as_i64()?;
        let types_only = take(&mut parts, "missing types-only flag")?.as_bool()?;
        let filter = Filter::from_packet(take(&mut parts, "missing filter")?)?;
        let attributes = take(&mut parts, "missing attribute list")?
            .into_children()?
            .into_iter()
            .map(|p| p.as_string().map_err(Error::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchRequest {
            base_dn,
            scope,
            deref_aliases,
            size_limit: u32::try_from(size_limit).map_err(|_| Error::Protocol("negative size limit"))?,
            time_limit: u32::try_from(time_limit).map_err(|_| Error::Protocol("negative time limit"))?,
            types_only,
            filter,
            attributes,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<PartialAttribute>,
}

impl SearchResultEntry {
    fn to_packet(&self) -> Packet {
        Packet::application(
            TAG_SEARCH_RESULT_ENTRY,
            vec![
                Packet::octet_string(self.object_name.clone()),
                Packet::sequence(self.attributes.iter().map(PartialAttribute::to_packet).collect()),
            ],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let object_name = take(&mut parts, "missing entry DN")?.as_string()?;
        let attributes = take(&mut parts, "missing entry attributes")?
            .into_children()?
            .into_iter()
            .map(PartialAttribute::from_packet)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchResultEntry { object_name, attributes })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyOperation {
    Add,
    Delete,
    Replace,
}

impl ModifyOperation {
    fn as_i64(self) -> i64 {
        match self {
            ModifyOperation::Add => 0,
            ModifyOperation::Delete => 1,
            ModifyOperation::Replace => 2,
        }
    }

    fn from_i64(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            _ => Err(Error::Protocol("invalid modify operation")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: PartialAttribute,
}

impl ModifyChange {
    pub fn add(modification: PartialAttribute) -> Self {
        ModifyChange {
            operation: ModifyOperation::Add,
            modification,
        }
    }

    pub fn delete(modification: PartialAttribute) -> Self {
        ModifyChange {
            operation: ModifyOperation::Delete,
            modification,
        }
    }

    pub fn replace(modification: PartialAttribute) -> Self {
        ModifyChange {
            operation: ModifyOperation::Replace,
            modification,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

impl ModifyRequest {
    fn to_packet(&self) -> Packet {
        let changes = self
            .changes
            .iter()
            .map(|c| {
                Packet::sequence(vec![
                    Packet::enumerated(c.operation.as_i64()),
                    c.modification.to_packet(),
                ])
            })
            .collect();
        Packet::application(
            TAG_MODIFY_REQUEST,
            vec![Packet::octet_string(self.object.clone()), Packet::sequence(changes)],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let object = take(&mut parts, "missing modify target")?.as_string()?;
        let changes = take(&mut parts, "missing modify changes")?
            .into_children()?
            .into_iter()
            .map(|p| {
                let mut fields = p.into_children()?.into_iter().peekable();
                let operation = ModifyOperation::from_i64(take(&mut fields, "missing change operation")?.as_i64()?)?;
                let modification = PartialAttribute::from_packet(take(&mut fields, "missing change attribute")?)?;
                Ok::<_, Error>(ModifyChange { operation, modification })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ModifyRequest { object, changes })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<PartialAttribute>,
}

impl AddRequest {
    fn to_packet(&self) -> Packet {
        Packet::application(
            TAG_ADD_REQUEST,
            vec![
                Packet::octet_string(self.entry.clone()),
                Packet::sequence(self.attributes.iter().map(PartialAttribute::to_packet).collect()),
            ],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let entry = take(&mut parts, "missing add target")?.as_string()?;
        let attributes = take(&mut parts, "missing add attributes")?
            .into_children()?
            .into_iter()
            .map(PartialAttribute::from_packet)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AddRequest { entry, attributes })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ModifyDnRequest {
    fn to_packet(&self) -> Packet {
        let mut children = vec![
            Packet::octet_string(self.entry.clone()),
            Packet::octet_string(self.new_rdn.clone()),
            Packet::boolean(self.delete_old_rdn),
        ];
        if let Some(new_superior) = &self.new_superior {
            children.push(Packet::context_primitive(0, new_superior.clone()));
        }
        Packet::application(TAG_MODIFY_DN_REQUEST, children)
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let entry = take(&mut parts, "missing modify-dn target")?.as_string()?;
        let new_rdn = take(&mut parts, "missing new RDN")?.as_string()?;
        let delete_old_rdn = take(&mut parts, "missing delete-old-rdn flag")?.as_bool()?;
        let new_superior = match parts.next() {
            Some(p) => Some(p.as_string()?),
            None => None,
        };
        Ok(ModifyDnRequest {
            entry,
            new_rdn,
            delete_old_rdn,
            new_superior,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attribute: String,
    pub value: Bytes,
}

impl CompareRequest {
    fn to_packet(&self) -> Packet {
        Packet::application(
            TAG_COMPARE_REQUEST,
            vec![
                Packet::octet_string(self.entry.clone()),
                Packet::sequence(vec![
                    Packet::octet_string(self.attribute.clone()),
                    Packet::octet_string(self.value.clone()),
                ]),
            ],
        )
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let entry = take(&mut parts, "missing compare target")?.as_string()?;
        let (attribute, value) = ava_from_parts(take(&mut parts, "missing compare assertion")?)?;
        Ok(CompareRequest { entry, attribute, value })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Bytes>,
}

impl ExtendedRequest {
    fn to_packet(&self) -> Packet {
        let mut children = vec![Packet::context_primitive(0, self.name.clone())];
        if let Some(value) = &self.value {
            children.push(Packet::context_primitive(1, value.clone()));
        }
        Packet::application(TAG_EXTENDED_REQUEST, children)
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let name = take(&mut parts, "missing extended request name")?.as_string()?;
        let value = match parts.next() {
            Some(p) => Some(p.payload()?.clone()),
            None => None,
        };
        Ok(ExtendedRequest { name, value })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Bytes>,
}

impl ExtendedResponse {
    fn to_packet(&self) -> Packet {
        let mut children = Vec::new();
        self.result.write_fields(&mut children);
        if let Some(name) = &self.name {
            children.push(Packet::context_primitive(10, name.clone()));
        }
        if let Some(value) = &self.value {
            children.push(Packet::context_primitive(11, value.clone()));
        }
        Packet::application(TAG_EXTENDED_RESPONSE, children)
    }

    fn from_packet(packet: Packet) -> Result<Self, Error> {
        let mut parts = packet.into_children()?.into_iter().peekable();
        let result = LdapResult::read_fields(&mut parts)?;
        let mut name = None;
        let mut value = None;
        for field in parts {
            match field.tag {
                10 => name = Some(field.as_string()?),
                11 => value = Some(field.payload()?.clone()),
                _ => return Err(Error::Protocol("invalid extended response field")),
            }
        }
        Ok(ExtendedResponse { result, name, value })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    SearchResultReference(Vec<String>),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    fn to_packet(&self) -> Packet {
        fn result_packet(tag: u32, result: &LdapResult) -> Packet {
            let mut children = Vec::new();
            result.write_fields(&mut children);
            Packet::application(tag, children)
        }

        match self {
            ProtocolOp::BindRequest(req) => req.to_packet(),
            ProtocolOp::BindResponse(resp) => resp.to_packet(),
            ProtocolOp::UnbindRequest => Packet::application_primitive(TAG_UNBIND_REQUEST, Bytes::new()),
            ProtocolOp::SearchRequest(req) => req.to_packet(),
            ProtocolOp::SearchResultEntry(entry) => entry.to_packet(),
            ProtocolOp::SearchResultDone(result) => result_packet(TAG_SEARCH_RESULT_DONE, result),
            ProtocolOp::SearchResultReference(urls) => Packet::application(
                TAG_SEARCH_RESULT_REFERENCE,
                urls.iter().map(|u| Packet::octet_string(u.clone())).collect(),
            ),
            ProtocolOp::ModifyRequest(req) => req.to_packet(),
            ProtocolOp::ModifyResponse(result) => result_packet(TAG_MODIFY_RESPONSE, result),
            ProtocolOp::AddRequest(req) => req.to_packet(),
            ProtocolOp::AddResponse(result) => result_packet(TAG_ADD_RESPONSE, result),
            ProtocolOp::DelRequest(dn) => Packet::application_primitive(TAG_DEL_REQUEST, dn.clone()),
            ProtocolOp::DelResponse(result) => result_packet(TAG_DEL_RESPONSE, result),
            ProtocolOp::ModifyDnRequest(req) => req.to_packet(),
            ProtocolOp::ModifyDnResponse(result) => result_packet(TAG_MODIFY_DN_RESPONSE, result),
            ProtocolOp::CompareRequest(req) => req.to_packet(),
            ProtocolOp::CompareResponse(result) => result_packet(TAG_COMPARE_RESPONSE, result),
            ProtocolOp::AbandonRequest(id) => {
                Packet::application_primitive(TAG_ABANDON_REQUEST, crate::ber::int_bytes(i64::from(*id)))
            }
            ProtocolOp::ExtendedRequest(req) => req.to_packet(),
            ProtocolOp::ExtendedResponse(resp) => resp.to_packet(),
        }
    }

    fn from_packet(packet: Packet, message_id: i32) -> Result<Self, Error> {
        fn result_fields(packet: Packet) -> Result<LdapResult, Error> {
            let mut parts = packet.into_children()?.into_iter().peekable();
            LdapResult::read_fields(&mut parts)
        }

        if packet.class != TagClass::Application {
            return Err(Error::Protocol("protocol op is not application-tagged"));
        }
        match packet.tag {
            TAG_BIND_REQUEST => Ok(ProtocolOp::BindRequest(BindRequest::from_packet(packet)?)),
            TAG_BIND_RESPONSE => Ok(ProtocolOp::BindResponse(BindResponse::from_packet(packet)?)),
            TAG_UNBIND_REQUEST => Ok(ProtocolOp::UnbindRequest),
            TAG_SEARCH_REQUEST => Ok(ProtocolOp::SearchRequest(SearchRequest::from_packet(packet)?)),
            TAG_SEARCH_RESULT_ENTRY => Ok(ProtocolOp::SearchResultEntry(SearchResultEntry::from_packet(packet)?)),
            TAG_SEARCH_RESULT_DONE => Ok(ProtocolOp::SearchResultDone(result_fields(packet)?)),
            TAG_SEARCH_RESULT_REFERENCE => {
                let urls = packet
                    .into_children()?
                    .into_iter()
                    .map(|p| p.as_string().map_err(Error::from))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ProtocolOp::SearchResultReference(urls))
            }
            TAG_MODIFY_REQUEST => Ok(ProtocolOp::ModifyRequest(ModifyRequest::from_packet(packet)?)),
            TAG_MODIFY_RESPONSE => Ok(ProtocolOp::ModifyResponse(result_fields(packet)?)),
            TAG_ADD_REQUEST => Ok(ProtocolOp::AddRequest(AddRequest::from_packet(packet)?)),
            TAG_ADD_RESPONSE => Ok(ProtocolOp::AddResponse(result_fields(packet)?)),
            TAG_DEL_REQUEST => Ok(ProtocolOp::DelRequest(packet.as_string()?)),
            TAG_DEL_RESPONSE => Ok(ProtocolOp::DelResponse(result_fields(packet)?)),
            TAG_MODIFY_DN_REQUEST => Ok(ProtocolOp::ModifyDnRequest(ModifyDnRequest::from_packet(packet)?)),
            TAG_MODIFY_DN_RESPONSE => Ok(ProtocolOp::ModifyDnResponse(result_fields(packet)?)),
            TAG_COMPARE_REQUEST => Ok(ProtocolOp::CompareRequest(CompareRequest::from_packet(packet)?)),
            TAG_COMPARE_RESPONSE => Ok(ProtocolOp::CompareResponse(result_fields(packet)?)),
            TAG_ABANDON_REQUEST => {
                let id = crate::ber::int_from_bytes(packet.payload()?)?;
                Ok(ProtocolOp::AbandonRequest(
                    i32::try_from(id).map_err(|_| Error::Protocol("abandoned id out of range"))?,
                ))
            }
            TAG_EXTENDED_REQUEST => Ok(ProtocolOp::ExtendedRequest(ExtendedRequest::from_packet(packet)?)),
            TAG_EXTENDED_RESPONSE => Ok(ProtocolOp::ExtendedResponse(ExtendedResponse::from_packet(packet)?)),
            tag => Err(Error::UnsupportedOp { message_id, tag }),
        }
    }
}

/// The protocol envelope: message-ID, operation, optional controls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        LdapMessage {
            message_id,
            protocol_op,
            controls: None,
        }
    }

    pub fn with_controls(message_id: i32, protocol_op: ProtocolOp, controls: Vec<Control>) -> Self {
        LdapMessage {
            message_id,
            protocol_op,
            controls: Some(controls),
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut children = vec![Packet::integer(i64::from(self.message_id)), self.protocol_op.to_packet()];
        if let Some(controls) = &self.controls {
            children.push(Packet::context(0, controls.iter().map(Control::to_packet).collect()));
        }
        Packet::sequence(children)
    }

    pub fn from_packet(packet: Packet) -> Result<Self, Error> {
        if !packet.is(TagClass::Universal, TAG_SEQUENCE) {
            return Err(Error::Protocol("message is not a SEQUENCE"));
        }
        let mut parts = packet.into_children()?.into_iter().peekable();
        let message_id = take(&mut parts, "missing message id")?.as_i64()?;
        let message_id = i32::try_from(message_id).map_err(|_| Error::Protocol("message id out of range"))?;
        if message_id < 0 {
            return Err(Error::Protocol("negative message id"));
        }
        let protocol_op = ProtocolOp::from_packet(take(&mut parts, "missing protocol op")?, message_id)?;
        let controls = match parts.next() {
            Some(p) if p.is(TagClass::Context, 0) => Some(
                p.into_children()?
                    .into_iter()
                    .map(Control::from_packet)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Some(_) => return Err(Error::Protocol("unexpected trailing message element")),
            None => None,
        };
        Ok(LdapMessage {
            message_id,
            protocol_op,
            controls,
        })
    }
}
