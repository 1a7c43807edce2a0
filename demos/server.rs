use ldap_duplex::{
    proto::{Control, ResultCode, SearchRequest},
    server::{BindHandler, SearchHandler, ServerSearchResult, SessionInfo},
    Attribute, LdapServer, SearchEntry,
};

struct StaticDirectory;

impl BindHandler for StaticDirectory {
    fn bind(&self, bind_dn: &str, password: &[u8], _session: &SessionInfo) -> ResultCode {
        if bind_dn.is_empty() && password.is_empty() {
            ResultCode::Success
        } else {
            ResultCode::InvalidCredentials
        }
    }
}

impl SearchHandler for StaticDirectory {
    fn search(
        &self,
        _bound_dn: &str,
        _request: &SearchRequest,
        _controls: &[Control],
        _session: &SessionInfo,
    ) -> ServerSearchResult {
        ServerSearchResult {
            entries: vec![SearchEntry::new(
                "cn=demo,o=example",
                vec![
                    Attribute::new("cn", ["demo"]),
                    Attribute::new("objectclass", ["posixaccount"]),
                ],
            )],
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();

    let mut server = LdapServer::new();
    server
        .bind_fn("", StaticDirectory)
        .search_fn("o=example", StaticDirectory);
    server.listen_and_serve("127.0.0.1:3389").await?;
    Ok(())
}
