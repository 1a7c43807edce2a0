pub use client::{LdapClient, LdapClientBuilder};
pub use filter::escape_filter;
pub use model::{Attribute, Attributes, SearchEntry, SearchResult};
pub use options::TlsOptions;
pub use server::LdapServer;

pub(crate) mod channel;
pub(crate) mod codec;
pub(crate) mod conn;

pub mod ber;
pub mod client;
pub mod controls;
pub mod dn;
pub mod error;
pub mod filter;
pub mod model;
pub mod oid;
pub mod options;
pub mod proto;
pub mod request;
pub mod server;
