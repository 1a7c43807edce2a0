use ldap_duplex::{
    proto::{DerefAliases, SearchRequest, SearchScope},
    LdapClient, TlsOptions,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();

    let mut client = LdapClient::builder("localhost")
        .port(389)
        .tls_options(TlsOptions::plain())
        .connect()
        .await?;
    client.simple_bind("cn=admin,dc=example,dc=org", "admin").await?;

    let req = SearchRequest::builder()
        .base_dn("dc=example,dc=org")
        .scope(SearchScope::WholeSubtree)
        .deref_aliases(DerefAliases::Never)
        .filter("(objectClass=*)")
        .attributes(["cn", "objectClass"])
        .build()?;

    let result = client.search(req).await?;
    for entry in result.entries {
        println!("{}", entry.dn);
    }

    client.close().await;
    Ok(())
}
