//! LDAP connection options

use native_tls::TlsConnector;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsKind {
    #[default]
    Plain,
    Tls,
    StartTls,
}

/// TLS options
#[derive(Debug, Default)]
pub struct TlsOptions {
    pub(crate) kind: TlsKind,
    pub(crate) connector: Option<TlsConnector>,
    pub(crate) domain_name: Option<String>,
    pub(crate) accept_invalid_certs: bool,
    pub(crate) accept_invalid_hostnames: bool,
}

impl TlsOptions {
    fn new(kind: TlsKind) -> Self {
        TlsOptions {
            kind,
            ..Default::default()
        }
    }

    /// Connect without transport security
    pub fn plain() -> Self {
        Self::new(TlsKind::Plain)
    }

    /// Connect using TLS transport
    pub fn tls() -> Self {
        Self::new(TlsKind::Tls)
    }

    /// Connect using STARTTLS negotiation
    pub fn start_tls() -> Self {
        Self::new(TlsKind::StartTls)
    }

    /// Use a preconfigured connector, e.g. for mutual TLS authentication
    pub fn tls_connector(mut self, connector: TlsConnector) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Specify custom domain name to use for SNI match. The default is the connection host name
    pub fn domain_name<S: AsRef<str>>(mut self, domain_name: S) -> Self {
        self.domain_name = Some(domain_name.as_ref().to_owned());
        self
    }

    /// Skip certificate chain verification
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Skip hostname verification
    pub fn danger_accept_invalid_hostnames(mut self, accept: bool) -> Self {
        self.accept_invalid_hostnames = accept;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_constructors() {
        assert_eq!(TlsOptions::plain().kind, TlsKind::Plain);
        assert_eq!(TlsOptions::tls().kind, TlsKind::Tls);
        assert_eq!(TlsOptions::start_tls().kind, TlsKind::StartTls);
        assert_eq!(TlsOptions::default().kind, TlsKind::Plain);
    }

    #[test]
    fn test_builder_switches() {
        let options = TlsOptions::tls()
            .domain_name("ldap.example.com")
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
        assert_eq!(options.kind, TlsKind::Tls);
        assert_eq!(options.domain_name.as_deref(), Some("ldap.example.com"));
        assert!(options.accept_invalid_certs);
        assert!(options.accept_invalid_hostnames);
        assert!(options.connector.is_none());
    }

    #[test]
    fn test_custom_connector_is_kept() {
        let connector = native_tls::TlsConnector::new().unwrap();
        let options = TlsOptions::start_tls().tls_connector(connector);
        assert_eq!(options.kind, TlsKind::StartTls);
        assert!(options.connector.is_some());
    }
}
