use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use bytes::Bytes;
use futures::StreamExt;
use log::{error, trace};

use crate::{
    conn::LdapConnection,
    controls::SimplePagedResultsControl,
    error::{Error, PagedSearchError},
    model::{Attributes, SearchResult},
    proto::{
        AddRequest, BindRequest, CompareRequest, LdapMessage, LdapResult, ModifyChange, ModifyDnRequest,
        ModifyRequest, ProtocolOp, ResultCode, SearchRequest,
    },
    TlsOptions,
};

pub struct LdapClientBuilder {
    address: String,
    port: u16,
    tls_options: TlsOptions,
}

impl LdapClientBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.tls_options = options;
        self
    }

    pub async fn connect(self) -> Result<LdapClient, Error> {
        LdapClient::connect(self.address, self.port, self.tls_options).await
    }
}

/// One logical LDAP session. Cheap to clone; clones share the underlying
/// connection and the message-id allocator, so concurrent requests from
/// clones multiplex over one socket.
#[derive(Clone)]
pub struct LdapClient {
    connection: LdapConnection,
    id_counter: Arc<AtomicU32>,
}

impl LdapClient {
    pub fn builder<A: AsRef<str>>(address: A) -> LdapClientBuilder {
        LdapClientBuilder {
            address: address.as_ref().to_owned(),
            port: 389,
            tls_options: TlsOptions::plain(),
        }
    }

    pub async fn connect<A>(address: A, port: u16, tls_options: TlsOptions) -> Result<Self, Error>
    where
        A: AsRef<str>,
    {
        let connection = LdapConnection::connect(address, port, tls_options).await?;
        Ok(Self {
            connection,
            id_counter: Arc::new(AtomicU32::new(2)), // 1 is used by STARTTLS
        })
    }

    fn new_id(&mut self) -> Result<i32, Error> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        i32::try_from(id).map_err(|_| Error::MessageIdsExhausted)
    }

    fn check_result(&self, result: LdapResult) -> Result<(), Error> {
        if result.result_code == ResultCode::Success {
            Ok(())
        } else {
            Err(Error::OperationFailed(result.into()))
        }
    }

    /// Simple bind; `("", "")` performs the anonymous bind.
    pub async fn simple_bind<U, P>(&mut self, username: U, password: P) -> Result<(), Error>
    where
        U: AsRef<str>,
        P: AsRef<str>,
    {
        let id = self.new_id()?;

        let req = BindRequest::simple(username.as_ref(), password.as_ref().to_owned());
        let msg = LdapMessage::new(id, ProtocolOp::BindRequest(req));

        trace!("Sending message: {:?}", msg);
        let item = self.connection.send_recv(msg).await?;
        trace!("Received message: {:?}", item);

        match item.protocol_op {
            ProtocolOp::BindResponse(resp) => self.check_result(resp.result),
            _ => Err(Error::InvalidResponse),
        }
    }

    pub async fn unbind(&mut self) -> Result<(), Error> {
        let id = self.new_id()?;

        let msg = LdapMessage::new(id, ProtocolOp::UnbindRequest);
        self.connection.send(msg).await?;
        Ok(())
    }

    /// Send Unbind (best effort) and drop the connection. Pending callers
    /// on clones of this client observe `ConnectionClosed`.
    pub async fn close(mut self) {
        let _ = self.unbind().await;
        self.connection.close();
    }

    pub async fn search(&mut self, request: SearchRequest) -> Result<SearchResult, Error> {
        let id = self.new_id()?;
        let msg = LdapMessage::new(id, ProtocolOp::SearchRequest(request));
        let (result, _) = self.search_stream(msg).await?;
        Ok(result)
    }

    /// One page of a paged search; returns entries plus the control carrying
    /// the server cookie.
    pub async fn search_paged(
        &mut self,
        request: SearchRequest,
        control: SimplePagedResultsControl,
    ) -> Result<(SearchResult, SimplePagedResultsControl), Error> {
        let id = self.new_id()?;
        let msg = LdapMessage::with_controls(id, ProtocolOp::SearchRequest(request), vec![control.into()]);

        let (result, controls) = self.search_stream(msg).await?;

        let control = controls
            .into_iter()
            .find(|c| c.control_type == SimplePagedResultsControl::OID)
            .map(SimplePagedResultsControl::try_from)
            .transpose()?
            .ok_or_else(|| {
                error!("No paged control in the SearchResultDone");
                Error::InvalidResponse
            })?;

        Ok((result, control))
    }

    /// Drive the paged-results control until the server returns an empty
    /// cookie, concatenating the pages in server order. A mid-stream failure
    /// carries everything collected so far.
    pub async fn search_with_paging(
        &mut self,
        request: SearchRequest,
        page_size: u32,
    ) -> Result<SearchResult, PagedSearchError> {
        let mut control = SimplePagedResultsControl::new(page_size);
        let mut acc = SearchResult::default();

        loop {
            match self.search_paged(request.clone(), control).await {
                Ok((page, next)) => {
                    acc.entries.extend(page.entries);
                    acc.references.extend(page.references);
                    if !next.has_entries() {
                        return Ok(acc);
                    }
                    control = next.with_size(page_size);
                }
                Err(source) => {
                    return Err(PagedSearchError {
                        partial: acc,
                        source,
                    })
                }
            }
        }
    }

    async fn search_stream(&mut self, msg: LdapMessage) -> Result<(SearchResult, Vec<crate::proto::Control>), Error> {
        trace!("Sending message: {:?}", msg);
        let mut stream = self.connection.send_recv_stream(msg).await?;
        let mut result = SearchResult::default();

        while let Some(item) = stream.next().await {
            trace!("Received message: {:?}", item);

            match item.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => result.entries.push(entry.into()),
                ProtocolOp::SearchResultReference(urls) => result.references.extend(urls),
                ProtocolOp::SearchResultDone(done) => {
                    self.check_result(done)?;
                    return Ok((result, item.controls.unwrap_or_default()));
                }
                other => {
                    error!("Invalid search response: {:?}", other);
                    return Err(Error::InvalidResponse);
                }
            }
        }
        // stream ended without SearchResultDone
        Err(Error::ConnectionClosed)
    }

    /// Returns true for CompareTrue (6), false for CompareFalse (5); any
    /// other result code is an error.
    pub async fn compare<D, A, V>(&mut self, dn: D, attribute: A, value: V) -> Result<bool, Error>
    where
        D: AsRef<str>,
        A: AsRef<str>,
        V: Into<Bytes>,
    {
        let id = self.new_id()?;
        let req = CompareRequest {
            entry: dn.as_ref().to_owned(),
            attribute: attribute.as_ref().to_owned(),
            value: value.into(),
        };
        let msg = LdapMessage::new(id, ProtocolOp::CompareRequest(req));

        let item = self.connection.send_recv(msg).await?;
        match item.protocol_op {
            ProtocolOp::CompareResponse(result) => match result.result_code {
                ResultCode::CompareTrue => Ok(true),
                ResultCode::CompareFalse => Ok(false),
                _ => Err(Error::OperationFailed(result.into())),
            },
            _ => Err(Error::InvalidResponse),
        }
    }

    pub async fn add<D>(&mut self, dn: D, attributes: Attributes) -> Result<(), Error>
    where
        D: AsRef<str>,
    {
        let id = self.new_id()?;
        let req = AddRequest {
            entry: dn.as_ref().to_owned(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        };
        let msg = LdapMessage::new(id, ProtocolOp::AddRequest(req));

        let item = self.connection.send_recv(msg).await?;
        match item.protocol_op {
            ProtocolOp::AddResponse(result) => self.check_result(result),
            _ => Err(Error::InvalidResponse),
        }
    }

    pub async fn modify<D>(&mut self, dn: D, changes: Vec<ModifyChange>) -> Result<(), Error>
    where
        D: AsRef<str>,
    {
        let id = self.new_id()?;
        let req = ModifyRequest {
            object: dn.as_ref().to_owned(),
            changes,
        };
        let msg = LdapMessage::new(id, ProtocolOp::ModifyRequest(req));

        let item = self.connection.send_recv(msg).await?;
        match item.protocol_op {
            ProtocolOp::ModifyResponse(result) => self.check_result(result),
            _ => Err(Error::InvalidResponse),
        }
    }

    pub async fn delete<D>(&mut self, dn: D) -> Result<(), Error>
    where
        D: AsRef<str>,
    {
        let id = self.new_id()?;
        let msg = LdapMessage::new(id, ProtocolOp::DelRequest(dn.as_ref().to_owned()));

        let item = self.connection.send_recv(msg).await?;
        match item.protocol_op {
            ProtocolOp::DelResponse(result) => self.check_result(result),
            _ => Err(Error::InvalidResponse),
        }
    }

    pub async fn modify_dn<D, R>(
        &mut self,
        dn: D,
        new_rdn: R,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    ) -> Result<(), Error>
    where
        D: AsRef<str>,
        R: AsRef<str>,
    {
        let id = self.new_id()?;
        let req = ModifyDnRequest {
            entry: dn.as_ref().to_owned(),
            new_rdn: new_rdn.as_ref().to_owned(),
            delete_old_rdn,
            new_superior,
        };
        let msg = LdapMessage::new(id, ProtocolOp::ModifyDnRequest(req));

        let item = self.connection.send_recv(msg).await?;
        match item.protocol_op {
            ProtocolOp::ModifyDnResponse(result) => self.check_result(result),
            _ => Err(Error::InvalidResponse),
        }
    }
}
