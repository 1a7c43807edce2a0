use std::time::Duration;

use crate::{
    error::Error,
    filter::parse_filter,
    proto::{DerefAliases, SearchRequest, SearchScope},
};

impl SearchRequest {
    pub fn builder() -> SearchRequestBuilder {
        SearchRequestBuilder::new()
    }
}

pub struct SearchRequestBuilder {
    base_dn: String,
    scope: SearchScope,
    deref_aliases: DerefAliases,
    size_limit: u32,
    time_limit: Duration,
    types_only: bool,
    filter: String,
    attributes: Vec<String>,
}

impl SearchRequestBuilder {
    pub(crate) fn new() -> Self {
        Self {
            base_dn: Default::default(),
            scope: SearchScope::BaseObject,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: Duration::default(),
            types_only: false,
            filter: "(objectClass=*)".to_owned(),
            attributes: Vec::new(),
        }
    }

    pub fn base_dn<S: AsRef<str>>(mut self, base_dn: S) -> Self {
        self.base_dn = base_dn.as_ref().to_owned();
        self
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn deref_aliases(mut self, deref_aliases: DerefAliases) -> Self {
        self.deref_aliases = deref_aliases;
        self
    }

    pub fn size_limit(mut self, size_limit: u32) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn types_only(mut self, types_only: bool) -> Self {
        self.types_only = types_only;
        self
    }

    pub fn filter<S: AsRef<str>>(mut self, filter: S) -> Self {
        self.filter = filter.as_ref().to_owned();
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn attribute<S>(mut self, attribute: S) -> Self
    where
        S: AsRef<str>,
    {
        self.attributes.push(attribute.as_ref().to_owned());
        self
    }

    pub fn build(self) -> Result<SearchRequest, Error> {
        Ok(SearchRequest {
            base_dn: self.base_dn,
            scope: self.scope,
            deref_aliases: self.deref_aliases,
            size_limit: self.size_limit,
            time_limit: self.time_limit.as_secs() as u32,
            types_only: self.types_only,
            filter: parse_filter(self.filter)?,
            attributes: self.attributes,
        })
    }
}
