//! Embeddable LDAP server: listener, per-session loop, suffix-routed
//! handlers, bind gating, stats and panic isolation.
//!
//! Handlers are registered per operation under a DN suffix; `""` is the
//! catch-all. A request is routed to the handler whose suffix is the
//! longest normalised tail of the target DN. Registration happens before
//! serving; the route table is frozen when `listen_and_serve` starts.

use std::{
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::mpsc,
};
use tokio_native_tls::{TlsAcceptor, TlsStream};
use tokio_util::codec::Framed;

use crate::{
    codec::LdapCodec,
    dn::Dn,
    error::Error,
    model::SearchEntry,
    oid,
    proto::{
        AddRequest, BindRequest, BindResponse, CompareRequest, Control, ExtendedRequest, ExtendedResponse,
        LdapMessage, LdapResult, ModifyDnRequest, ModifyRequest, ProtocolOp, ResultCode, SearchRequest,
        Authentication,
    },
};

/// Connection-level facts handlers may inspect.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub peer_addr: SocketAddr,
    pub tls: bool,
}

/// What a search handler hands back; framed verbatim into the response
/// stream. Result code 0 with no entries is a valid empty result.
#[derive(Clone, Debug)]
pub struct ServerSearchResult {
    pub entries: Vec<SearchEntry>,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
    pub result_code: ResultCode,
}

impl Default for ServerSearchResult {
    fn default() -> Self {
        ServerSearchResult {
            entries: Vec::new(),
            referrals: Vec::new(),
            controls: Vec::new(),
            result_code: ResultCode::Success,
        }
    }
}

/// What an extended handler hands back.
#[derive(Clone, Debug)]
pub struct ExtendedResult {
    pub result_code: ResultCode,
    pub response_name: Option<String>,
    pub response_value: Option<Bytes>,
}

impl Default for ExtendedResult {
    fn default() -> Self {
        ExtendedResult {
            result_code: ResultCode::Success,
            response_name: None,
            response_value: None,
        }
    }
}

pub trait BindHandler: Send + Sync {
    fn bind(&self, bind_dn: &str, password: &[u8], session: &SessionInfo) -> ResultCode;
}

pub trait SearchHandler: Send + Sync {
    fn search(
        &self,
        bound_dn: &str,
        request: &SearchRequest,
        controls: &[Control],
        session: &SessionInfo,
    ) -> ServerSearchResult;
}

pub trait AddHandler: Send + Sync {
    fn add(&self, bound_dn: &str, request: &AddRequest, session: &SessionInfo) -> ResultCode;
}

pub trait ModifyHandler: Send + Sync {
    fn modify(&self, bound_dn: &str, request: &ModifyRequest, session: &SessionInfo) -> ResultCode;
}

pub trait DeleteHandler: Send + Sync {
    fn delete(&self, bound_dn: &str, dn: &str, session: &SessionInfo) -> ResultCode;
}

pub trait ModifyDnHandler: Send + Sync {
    fn modify_dn(&self, bound_dn: &str, request: &ModifyDnRequest, session: &SessionInfo) -> ResultCode;
}

pub trait CompareHandler: Send + Sync {
    fn compare(&self, bound_dn: &str, request: &CompareRequest, session: &SessionInfo) -> ResultCode;
}

pub trait AbandonHandler: Send + Sync {
    fn abandon(&self, bound_dn: &str, message_id: i32, session: &SessionInfo);
}

pub trait ExtendedHandler: Send + Sync {
    fn extended(&self, bound_dn: &str, request: &ExtendedRequest, session: &SessionInfo) -> ExtendedResult;
}

#[derive(Clone, Default)]
struct Routes {
    bind: Vec<(Dn, Arc<dyn BindHandler>)>,
    search: Vec<(Dn, Arc<dyn SearchHandler>)>,
    add: Vec<(Dn, Arc<dyn AddHandler>)>,
    modify: Vec<(Dn, Arc<dyn ModifyHandler>)>,
    delete: Vec<(Dn, Arc<dyn DeleteHandler>)>,
    modify_dn: Vec<(Dn, Arc<dyn ModifyDnHandler>)>,
    compare: Vec<(Dn, Arc<dyn CompareHandler>)>,
    abandon: Vec<(Dn, Arc<dyn AbandonHandler>)>,
    extended: Vec<(Dn, Arc<dyn ExtendedHandler>)>,
}

/// Longest-suffix match; the catch-all empty suffix matches everything.
fn route<'a, H: ?Sized>(table: &'a [(Dn, Arc<H>)], target: &Dn) -> Option<&'a Arc<H>> {
    table
        .iter()
        .filter(|(suffix, _)| target.ends_with(suffix))
        .max_by_key(|(suffix, _)| suffix.len())
        .map(|(_, handler)| handler)
}

#[derive(Default)]
struct Counters {
    conns: AtomicU64,
    binds: AtomicU64,
    unbinds: AtomicU64,
    searches: AtomicU64,
    adds: AtomicU64,
    modifies: AtomicU64,
    deletes: AtomicU64,
    modify_dns: AtomicU64,
    compares: AtomicU64,
    abandons: AtomicU64,
    extendeds: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            conns: self.conns.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            unbinds: self.unbinds.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            adds: self.adds.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            modify_dns: self.modify_dns.load(Ordering::Relaxed),
            compares: self.compares.load(Ordering::Relaxed),
            abandons: self.abandons.load(Ordering::Relaxed),
            extendeds: self.extendeds.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the server counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub conns: u64,
    pub binds: u64,
    pub unbinds: u64,
    pub searches: u64,
    pub adds: u64,
    pub modifies: u64,
    pub deletes: u64,
    pub modify_dns: u64,
    pub compares: u64,
    pub abandons: u64,
    pub extendeds: u64,
}

/// Cloneable view of the counters, usable while the server task runs.
#[derive(Clone)]
pub struct StatsHandle {
    counters: Arc<Counters>,
}

impl StatsHandle {
    pub fn get(&self) -> Stats {
        self.counters.snapshot()
    }
}

struct SessionContext {
    routes: Routes,
    counters: Arc<Counters>,
    stats_enabled: bool,
    start_tls: Option<TlsAcceptor>,
}

impl SessionContext {
    fn bump(&self, pick: impl FnOnce(&Counters) -> &AtomicU64) {
        if self.stats_enabled {
            pick(&self.counters).fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct LdapServer {
    routes: Routes,
    counters: Arc<Counters>,
    stats_enabled: bool,
    quit: Option<mpsc::Receiver<()>>,
    identity: Option<native_tls::Identity>,
}

impl Default for LdapServer {
    fn default() -> Self {
        Self::new()
    }
}

impl LdapServer {
    pub fn new() -> Self {
        LdapServer {
            routes: Routes::default(),
            counters: Arc::new(Counters::default()),
            stats_enabled: false,
            quit: None,
            identity: None,
        }
    }

    /// Register a bind handler under a DN suffix.
    ///
    /// # Panics
    /// Panics when `suffix` is not a valid DN.
    pub fn bind_fn(&mut self, suffix: &str, handler: impl BindHandler + 'static) -> &mut Self {
        self.routes.bind.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn search_fn(&mut self, suffix: &str, handler: impl SearchHandler + 'static) -> &mut Self {
        self.routes.search.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn add_fn(&mut self, suffix: &str, handler: impl AddHandler + 'static) -> &mut Self {
        self.routes.add.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn modify_fn(&mut self, suffix: &str, handler: impl ModifyHandler + 'static) -> &mut Self {
        self.routes.modify.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn delete_fn(&mut self, suffix: &str, handler: impl DeleteHandler + 'static) -> &mut Self {
        self.routes.delete.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn modify_dn_fn(&mut self, suffix: &str, handler: impl ModifyDnHandler + 'static) -> &mut Self {
        self.routes.modify_dn.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn compare_fn(&mut self, suffix: &str, handler: impl CompareHandler + 'static) -> &mut Self {
        self.routes.compare.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn abandon_fn(&mut self, suffix: &str, handler: impl AbandonHandler + 'static) -> &mut Self {
        self.routes.abandon.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    pub fn extended_fn(&mut self, suffix: &str, handler: impl ExtendedHandler + 'static) -> &mut Self {
        self.routes.extended.push((parse_suffix(suffix), Arc::new(handler)));
        self
    }

    /// Serving stops accepting once the channel yields (or closes); open
    /// sessions drain naturally.
    pub fn quit_channel(&mut self, quit: mpsc::Receiver<()>) -> &mut Self {
        self.quit = Some(quit);
        self
    }

    pub fn set_stats(&mut self, enabled: bool) -> &mut Self {
        self.stats_enabled = enabled;
        self
    }

    pub fn get_stats(&self) -> Stats {
        self.counters.snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            counters: self.counters.clone(),
        }
    }

    /// Provide a TLS identity so plaintext sessions may upgrade via the
    /// StartTLS extended operation.
    pub fn tls_identity(&mut self, identity: native_tls::Identity) -> &mut Self {
        self.identity = Some(identity);
        self
    }

    pub async fn listen_and_serve<A: ToSocketAddrs>(&mut self, addr: A) -> Result<(), Error> {
        self.serve(addr, None).await
    }

    /// Like `listen_and_serve`, but each accepted socket is wrapped in a TLS
    /// handshake first. `cert_file`/`key_file` are PEM paths.
    pub async fn listen_and_serve_tls<A: ToSocketAddrs>(
        &mut self,
        addr: A,
        cert_file: &str,
        key_file: &str,
    ) -> Result<(), Error> {
        let cert = std::fs::read(cert_file)?;
        let key = std::fs::read(key_file)?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
        let acceptor = TlsAcceptor::from(native_tls::TlsAcceptor::new(identity)?);
        self.serve(addr, Some(acceptor)).await
    }

    async fn serve<A: ToSocketAddrs>(&mut self, addr: A, acceptor: Option<TlsAcceptor>) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);

        let start_tls = match &self.identity {
            Some(identity) => Some(TlsAcceptor::from(native_tls::TlsAcceptor::new(identity.clone())?)),
            None => acceptor.clone(),
        };
        let ctx = Arc::new(SessionContext {
            routes: self.routes.clone(),
            counters: self.counters.clone(),
            stats_enabled: self.stats_enabled,
            start_tls,
        });
        let mut quit = self.quit.take();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            ctx.bump(|c| &c.conns);
                            let ctx = ctx.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let stream = match acceptor {
                                    Some(acceptor) => match acceptor.accept(socket).await {
                                        Ok(tls) => SessionStream::Tls(Box::new(tls)),
                                        Err(e) => {
                                            error!("TLS handshake with {} failed: {}", peer_addr, e);
                                            return;
                                        }
                                    },
                                    None => SessionStream::Tcp(socket),
                                };
                                if let Err(e) = run_session(stream, peer_addr, ctx).await {
                                    debug!("Session {} closed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
                _ = wait_for_quit(&mut quit) => {
                    info!("Quit signal received, shutting the listener down");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn parse_suffix(suffix: &str) -> Dn {
    Dn::parse(suffix).expect("handler suffix must be a valid DN")
}

async fn wait_for_quit(quit: &mut Option<mpsc::Receiver<()>>) {
    match quit {
        Some(receiver) => {
            receiver.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Plain or TLS-wrapped session transport, so one session loop serves
/// `ldap://`, `ldaps://` and StartTLS upgrades.
enum SessionStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SessionStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            SessionStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            SessionStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            SessionStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            SessionStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

struct SessionState {
    info: SessionInfo,
    bound_dn: String,
    authenticated: bool,
}

/// Run a handler behind a panic boundary. A panic is logged locally and
/// reported as a plain failure; nothing from the payload reaches the wire.
fn catch<T>(f: impl FnOnce() -> T) -> Result<T, ()> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        error!("Handler panicked: {}", msg);
    })
}

#[derive(Clone, Copy)]
enum ReplyKind {
    Search,
    Modify,
    Add,
    Del,
    ModifyDn,
    Compare,
}

fn result_message(id: i32, kind: ReplyKind, code: ResultCode, diag: &str) -> LdapMessage {
    let result = LdapResult::new(code, "", diag);
    let op = match kind {
        ReplyKind::Search => ProtocolOp::SearchResultDone(result),
        ReplyKind::Modify => ProtocolOp::ModifyResponse(result),
        ReplyKind::Add => ProtocolOp::AddResponse(result),
        ReplyKind::Del => ProtocolOp::DelResponse(result),
        ReplyKind::ModifyDn => ProtocolOp::ModifyDnResponse(result),
        ReplyKind::Compare => ProtocolOp::CompareResponse(result),
    };
    LdapMessage::new(id, op)
}

fn extended_reply(id: i32, code: ResultCode, diag: &str, name: Option<&str>) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::new(code, "", diag),
            name: name.map(str::to_owned),
            value: None,
        }),
    )
}

/// Gate, route and invoke for the single-result operations.
fn dispatch_simple<H: ?Sized>(
    session: &SessionState,
    table: &[(Dn, Arc<H>)],
    target_dn: &str,
    invoke: impl FnOnce(&Arc<H>) -> ResultCode,
) -> (ResultCode, &'static str) {
    if !session.authenticated {
        return (ResultCode::OperationsError, "authentication required");
    }
    let target = match Dn::parse(target_dn) {
        Ok(target) => target,
        Err(_) => return (ResultCode::InvalidDnSyntax, "cannot parse target DN"),
    };
    match route(table, &target) {
        None => (ResultCode::OperationsError, "no handler for operation"),
        Some(handler) => match catch(|| invoke(handler)) {
            Ok(code) => (code, ""),
            Err(()) => (ResultCode::OperationsError, "internal handler error"),
        },
    }
}

fn handle_bind(ctx: &SessionContext, session: &mut SessionState, id: i32, req: BindRequest) -> LdapMessage {
    // a new bind resets whatever authentication the session had
    session.authenticated = false;
    session.bound_dn.clear();

    let (code, diag): (ResultCode, &str) = match &req.authentication {
        Authentication::Sasl { .. } => (ResultCode::AuthMethodNotSupported, "only simple binds are supported"),
        Authentication::Simple(password) => match Dn::parse(&req.name) {
            Err(_) => (ResultCode::InvalidDnSyntax, "cannot parse bind DN"),
            Ok(target) => match route(&ctx.routes.bind, &target) {
                None => (ResultCode::InvalidCredentials, ""),
                Some(handler) => match catch(|| handler.bind(&req.name, password, &session.info)) {
                    Ok(code) => (code, ""),
                    Err(()) => (ResultCode::OperationsError, "internal handler error"),
                },
            },
        },
    };

    if code == ResultCode::Success {
        session.bound_dn = req.name;
        session.authenticated = true;
    }

    LdapMessage::new(
        id,
        ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::new(code, "", diag),
            server_sasl_creds: None,
        }),
    )
}

async fn run_session(stream: SessionStream, peer_addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<(), Error> {
    let tls = matches!(stream, SessionStream::Tls(_));
    let mut framed = Framed::new(stream, LdapCodec::default());
    let mut session = SessionState {
        info: SessionInfo { peer_addr, tls },
        bound_dn: String::new(),
        authenticated: false,
    };

    loop {
        let msg = match framed.next().await {
            None => break,
            Some(Ok(msg)) => msg,
            Some(Err(Error::UnsupportedOp { message_id, tag })) => {
                debug!("Unsupported operation tag {} from {}", tag, peer_addr);
                framed
                    .send(extended_reply(
                        message_id,
                        ResultCode::UnwillingToPerform,
                        "unsupported operation",
                        None,
                    ))
                    .await?;
                continue;
            }
            // malformed framing closes the session
            Some(Err(e)) => return Err(e),
        };

        let id = msg.message_id;
        let controls = msg.controls.unwrap_or_default();

        match msg.protocol_op {
            ProtocolOp::BindRequest(req) => {
                ctx.bump(|c| &c.binds);
                let reply = handle_bind(&ctx, &mut session, id, req);
                framed.send(reply).await?;
            }
            ProtocolOp::UnbindRequest => {
                ctx.bump(|c| &c.unbinds);
                debug!("Unbind from {}", peer_addr);
                break;
            }
            ProtocolOp::AbandonRequest(abandoned) => {
                ctx.bump(|c| &c.abandons);
                if let Ok(target) = Dn::parse(&session.bound_dn) {
                    if let Some(handler) = route(&ctx.routes.abandon, &target) {
                        let _ = catch(|| handler.abandon(&session.bound_dn, abandoned, &session.info));
                    }
                }
                // no response per RFC 4511
            }
            ProtocolOp::SearchRequest(req) => {
                ctx.bump(|c| &c.searches);
                if !session.authenticated {
                    framed
                        .send(result_message(
                            id,
                            ReplyKind::Search,
                            ResultCode::OperationsError,
                            "authentication required",
                        ))
                        .await?;
                    continue;
                }
                let target = match Dn::parse(&req.base_dn) {
                    Ok(target) => target,
                    Err(_) => {
                        framed
                            .send(result_message(
                                id,
                                ReplyKind::Search,
                                ResultCode::InvalidDnSyntax,
                                "cannot parse search base",
                            ))
                            .await?;
                        continue;
                    }
                };
                match route(&ctx.routes.search, &target) {
                    None => {
                        framed
                            .send(result_message(
                                id,
                                ReplyKind::Search,
                                ResultCode::OperationsError,
                                "no search handler",
                            ))
                            .await?;
                    }
                    Some(handler) => {
                        match catch(|| handler.search(&session.bound_dn, &req, &controls, &session.info)) {
                            Err(()) => {
                                framed
                                    .send(result_message(
                                        id,
                                        ReplyKind::Search,
                                        ResultCode::OperationsError,
                                        "internal handler error",
                                    ))
                                    .await?;
                            }
                            Ok(result) => {
                                for entry in result.entries {
                                    framed
                                        .send(LdapMessage::new(id, ProtocolOp::SearchResultEntry(entry.into())))
                                        .await?;
                                }
                                if !result.referrals.is_empty() {
                                    framed
                                        .send(LdapMessage::new(
                                            id,
                                            ProtocolOp::SearchResultReference(result.referrals),
                                        ))
                                        .await?;
                                }
                                let mut done = result_message(id, ReplyKind::Search, result.result_code, "");
                                if !result.controls.is_empty() {
                                    done.controls = Some(result.controls);
                                }
                                framed.send(done).await?;
                            }
                        }
                    }
                }
            }
            ProtocolOp::AddRequest(req) => {
                ctx.bump(|c| &c.adds);
                let (code, diag) = dispatch_simple(&session, &ctx.routes.add, &req.entry, |handler| {
                    handler.add(&session.bound_dn, &req, &session.info)
                });
                framed.send(result_message(id, ReplyKind::Add, code, diag)).await?;
            }
            ProtocolOp::ModifyRequest(req) => {
                ctx.bump(|c| &c.modifies);
                let (code, diag) = dispatch_simple(&session, &ctx.routes.modify, &req.object, |handler| {
                    handler.modify(&session.bound_dn, &req, &session.info)
                });
                framed.send(result_message(id, ReplyKind::Modify, code, diag)).await?;
            }
            ProtocolOp::DelRequest(dn) => {
                ctx.bump(|c| &c.deletes);
                let (code, diag) = dispatch_simple(&session, &ctx.routes.delete, &dn, |handler| {
                    handler.delete(&session.bound_dn, &dn, &session.info)
                });
                framed.send(result_message(id, ReplyKind::Del, code, diag)).await?;
            }
            ProtocolOp::ModifyDnRequest(req) => {
                ctx.bump(|c| &c.modify_dns);
                let (code, diag) = dispatch_simple(&session, &ctx.routes.modify_dn, &req.entry, |handler| {
                    handler.modify_dn(&session.bound_dn, &req, &session.info)
                });
                framed.send(result_message(id, ReplyKind::ModifyDn, code, diag)).await?;
            }
            ProtocolOp::CompareRequest(req) => {
                ctx.bump(|c| &c.compares);
                let (code, diag) = dispatch_simple(&session, &ctx.routes.compare, &req.entry, |handler| {
                    handler.compare(&session.bound_dn, &req, &session.info)
                });
                framed.send(result_message(id, ReplyKind::Compare, code, diag)).await?;
            }
            ProtocolOp::ExtendedRequest(req) if req.name == oid::STARTTLS_OID => {
                ctx.bump(|c| &c.extendeds);
                if session.info.tls {
                    framed
                        .send(extended_reply(
                            id,
                            ResultCode::OperationsError,
                            "session is already secured",
                            None,
                        ))
                        .await?;
                    continue;
                }
                let Some(acceptor) = &ctx.start_tls else {
                    framed
                        .send(extended_reply(
                            id,
                            ResultCode::UnwillingToPerform,
                            "StartTLS is not configured",
                            None,
                        ))
                        .await?;
                    continue;
                };
                framed
                    .send(extended_reply(id, ResultCode::Success, "", Some(oid::STARTTLS_OID)))
                    .await?;
                let parts = framed.into_parts();
                if !parts.read_buf.is_empty() {
                    // the peer must not pipeline past its own handshake
                    return Err(Error::Protocol("data received before TLS handshake"));
                }
                let upgraded = match parts.io {
                    SessionStream::Tcp(tcp) => SessionStream::Tls(Box::new(acceptor.accept(tcp).await?)),
                    tls @ SessionStream::Tls(_) => tls,
                };
                framed = Framed::new(upgraded, LdapCodec::default());
                session.info.tls = true;
                debug!("Session {} upgraded via StartTLS", peer_addr);
            }
            ProtocolOp::ExtendedRequest(req) => {
                ctx.bump(|c| &c.extendeds);
                if !session.authenticated {
                    framed
                        .send(extended_reply(
                            id,
                            ResultCode::OperationsError,
                            "authentication required",
                            None,
                        ))
                        .await?;
                    continue;
                }
                let target = Dn::parse(&session.bound_dn).unwrap_or_default();
                match route(&ctx.routes.extended, &target) {
                    None => {
                        framed
                            .send(extended_reply(
                                id,
                                ResultCode::UnwillingToPerform,
                                "no extended handler",
                                None,
                            ))
                            .await?;
                    }
                    Some(handler) => {
                        let reply = match catch(|| handler.extended(&session.bound_dn, &req, &session.info)) {
                            Err(()) => extended_reply(id, ResultCode::OperationsError, "internal handler error", None),
                            Ok(result) => LdapMessage::new(
                                id,
                                ProtocolOp::ExtendedResponse(ExtendedResponse {
                                    result: LdapResult::new(result.result_code, "", ""),
                                    name: result.response_name,
                                    value: result.response_value,
                                }),
                            ),
                        };
                        framed.send(reply).await?;
                    }
                }
            }
            // a server never expects response PDUs
            _ => {
                framed
                    .send(extended_reply(id, ResultCode::ProtocolError, "unexpected PDU", None))
                    .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        ber::{self, Packet, DEFAULT_MAX_PACKET_SIZE},
        controls::SimplePagedResultsControl,
        model::{Attribute, SearchResult},
        proto::SearchScope,
        LdapClient, TlsOptions,
    };

    struct BindAnonOk;

    impl BindHandler for BindAnonOk {
        fn bind(&self, bind_dn: &str, password: &[u8], _session: &SessionInfo) -> ResultCode {
            if bind_dn.is_empty() && password.is_empty() {
                ResultCode::Success
            } else {
                ResultCode::InvalidCredentials
            }
        }
    }

    struct BindSimple;

    impl BindHandler for BindSimple {
        fn bind(&self, bind_dn: &str, password: &[u8], _session: &SessionInfo) -> ResultCode {
            if bind_dn == "cn=testy,o=testers,c=test" && password == b"iLike2test" {
                ResultCode::Success
            } else {
                ResultCode::InvalidCredentials
            }
        }
    }

    struct BindPanic;

    impl BindHandler for BindPanic {
        fn bind(&self, _bind_dn: &str, _password: &[u8], _session: &SessionInfo) -> ResultCode {
            panic!("test panic at the disco");
        }
    }

    fn test_entries() -> Vec<SearchEntry> {
        vec![
            SearchEntry::new(
                "cn=ned,o=testers,c=test",
                vec![
                    Attribute::new("cn", ["ned"]),
                    Attribute::new("o", ["ate"]),
                    Attribute::new("uidNumber", ["5000"]),
                    Attribute::new("accountstatus", ["active"]),
                    Attribute::new("uid", ["ned"]),
                    Attribute::new("description", ["ned via sa"]),
                    Attribute::new("objectclass", ["posixaccount"]),
                ],
            ),
            SearchEntry::new(
                "cn=trent,o=testers,c=test",
                vec![
                    Attribute::new("cn", ["trent"]),
                    Attribute::new("o", ["ate"]),
                    Attribute::new("uidNumber", ["5005"]),
                    Attribute::new("accountstatus", ["active"]),
                    Attribute::new("uid", ["trent"]),
                    Attribute::new("objectclass", ["posixaccount"]),
                ],
            ),
            SearchEntry::new(
                "cn=randy,o=testers,c=test",
                vec![
                    Attribute::new("cn", ["randy"]),
                    Attribute::new("uidNumber", ["5555"]),
                    Attribute::new("uid", ["randy"]),
                    Attribute::new("objectclass", ["posixaccount"]),
                ],
            ),
        ]
    }

    struct SearchSimple;

    impl SearchHandler for SearchSimple {
        fn search(
            &self,
            _bound_dn: &str,
            _request: &SearchRequest,
            _controls: &[Control],
            _session: &SessionInfo,
        ) -> ServerSearchResult {
            ServerSearchResult {
                entries: test_entries(),
                ..Default::default()
            }
        }
    }

    struct SearchNamed(&'static str);

    impl SearchHandler for SearchNamed {
        fn search(
            &self,
            _bound_dn: &str,
            _request: &SearchRequest,
            _controls: &[Control],
            _session: &SessionInfo,
        ) -> ServerSearchResult {
            ServerSearchResult {
                entries: vec![SearchEntry::new(self.0, vec![])],
                ..Default::default()
            }
        }
    }

    struct SearchPanic;

    impl SearchHandler for SearchPanic {
        fn search(
            &self,
            _bound_dn: &str,
            _request: &SearchRequest,
            _controls: &[Control],
            _session: &SessionInfo,
        ) -> ServerSearchResult {
            panic!("this is a test panic");
        }
    }

    /// Serves pages of a fixed entry list, driven by the paged-results
    /// cookie (a decimal offset).
    struct PagedDirectory;

    impl SearchHandler for PagedDirectory {
        fn search(
            &self,
            _bound_dn: &str,
            _request: &SearchRequest,
            controls: &[Control],
            _session: &SessionInfo,
        ) -> ServerSearchResult {
            let entries: Vec<SearchEntry> = (0..5)
                .map(|i| SearchEntry::new(format!("cn=user{i},o=paged,c=test"), vec![]))
                .collect();

            let control = controls
                .iter()
                .find(|c| c.control_type == SimplePagedResultsControl::OID)
                .cloned()
                .map(|c| SimplePagedResultsControl::try_from(c).unwrap());

            match control {
                None => ServerSearchResult {
                    entries,
                    ..Default::default()
                },
                Some(control) => {
                    let offset: usize = std::str::from_utf8(control.cookie())
                        .ok()
                        .filter(|s| !s.is_empty())
                        .map(|s| s.parse().unwrap())
                        .unwrap_or(0);
                    let end = (offset + control.size() as usize).min(entries.len());
                    let cookie = if end < entries.len() { end.to_string() } else { String::new() };
                    let reply = SimplePagedResultsControl::new(control.size()).with_cookie(cookie);
                    ServerSearchResult {
                        entries: entries[offset..end].to_vec(),
                        controls: vec![reply.into()],
                        ..Default::default()
                    }
                }
            }
        }
    }

    struct CompareCn;

    impl CompareHandler for CompareCn {
        fn compare(&self, _bound_dn: &str, request: &CompareRequest, _session: &SessionInfo) -> ResultCode {
            if request.entry == "uid=qa,ou=users,dc=debian,dc=org"
                && request.attribute == "cn"
                && request.value.as_ref() == b"Debian QA"
            {
                ResultCode::CompareTrue
            } else {
                ResultCode::CompareFalse
            }
        }
    }

    struct RecordingOps;

    impl AddHandler for RecordingOps {
        fn add(&self, _bound_dn: &str, request: &AddRequest, _session: &SessionInfo) -> ResultCode {
            assert_eq!(request.entry, "cn=new,o=testers,c=test");
            ResultCode::Success
        }
    }

    impl ModifyHandler for RecordingOps {
        fn modify(&self, _bound_dn: &str, request: &ModifyRequest, _session: &SessionInfo) -> ResultCode {
            assert_eq!(request.changes.len(), 1);
            ResultCode::Success
        }
    }

    impl DeleteHandler for RecordingOps {
        fn delete(&self, _bound_dn: &str, dn: &str, _session: &SessionInfo) -> ResultCode {
            if dn == "cn=missing,o=testers,c=test" {
                ResultCode::NoSuchObject
            } else {
                ResultCode::Success
            }
        }
    }

    impl ModifyDnHandler for RecordingOps {
        fn modify_dn(&self, _bound_dn: &str, request: &ModifyDnRequest, _session: &SessionInfo) -> ResultCode {
            assert_eq!(request.new_rdn, "cn=renamed");
            ResultCode::Success
        }
    }

    struct AbandonFlag(Arc<std::sync::atomic::AtomicBool>);

    impl AbandonHandler for AbandonFlag {
        fn abandon(&self, _bound_dn: &str, _message_id: i32, _session: &SessionInfo) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn spawn_server(port: u16, mut server: LdapServer) -> (mpsc::Sender<()>, StatsHandle) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        server.quit_channel(quit_rx);
        let stats = server.stats_handle();
        tokio::spawn(async move {
            server
                .listen_and_serve(("127.0.0.1", port))
                .await
                .expect("listen_and_serve failed");
        });
        (quit_tx, stats)
    }

    fn spawn_tls_server(port: u16, mut server: LdapServer) -> mpsc::Sender<()> {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        server.quit_channel(quit_rx);
        tokio::spawn(async move {
            server
                .listen_and_serve_tls(("127.0.0.1", port), "tests/cert_DONOTUSE.pem", "tests/key_DONOTUSE.pem")
                .await
                .expect("listen_and_serve_tls failed");
        });
        quit_tx
    }

    fn test_identity() -> native_tls::Identity {
        let cert = std::fs::read("tests/cert_DONOTUSE.pem").expect("test certificate");
        let key = std::fs::read("tests/key_DONOTUSE.pem").expect("test key");
        native_tls::Identity::from_pkcs8(&cert, &key).expect("test identity")
    }

    fn insecure_tls() -> TlsOptions {
        TlsOptions::tls()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
    }

    fn insecure_start_tls() -> TlsOptions {
        TlsOptions::start_tls()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
    }

    async fn connect_client_with(port: u16, options: fn() -> TlsOptions) -> LdapClient {
        for _ in 0..100 {
            if let Ok(client) = LdapClient::builder("127.0.0.1")
                .port(port)
                .tls_options(options())
                .connect()
                .await
            {
                return client;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not come up on port {port}");
    }

    async fn connect_client(port: u16) -> LdapClient {
        connect_client_with(port, TlsOptions::plain).await
    }

    async fn raw_connect(port: u16) -> TcpStream {
        for _ in 0..100 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not come up on port {port}");
    }

    fn subtree_search(base: &str) -> SearchRequest {
        SearchRequest::builder()
            .base_dn(base)
            .scope(SearchScope::WholeSubtree)
            .filter("(objectclass=*)")
            .build()
            .unwrap()
    }

    fn result_code(err: Error) -> ResultCode {
        match err {
            Error::OperationFailed(op) => op.result_code,
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_bind_and_search() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", SearchSimple);
        let (_quit, _) = spawn_server(26389, server);

        let mut client = connect_client(26389).await;
        client.simple_bind("", "").await.unwrap();
        let result = client.search(subtree_search("o=testers,c=test")).await.unwrap();
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.entries[0].dn, "cn=ned,o=testers,c=test");
        assert_eq!(result.entries[2].dn, "cn=randy,o=testers,c=test");
        client.close().await;
    }

    #[tokio::test]
    async fn test_bind_without_handler_is_invalid_credentials() {
        let (_quit, _) = spawn_server(26390, LdapServer::new());

        let mut client = connect_client(26390).await;
        let err = client.simple_bind("", "").await.unwrap_err();
        assert_eq!(result_code(err), ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_simple_bind_credentials() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindSimple);
        let (_quit, _) = spawn_server(26391, server);

        let mut client = connect_client(26391).await;
        let err = client
            .simple_bind("cn=testy,o=testers,c=test", "BADPassword")
            .await
            .unwrap_err();
        assert_eq!(result_code(err), ResultCode::InvalidCredentials);

        let err = client
            .simple_bind("cn=testoy,o=testers,c=test", "iLike2test")
            .await
            .unwrap_err();
        assert_eq!(result_code(err), ResultCode::InvalidCredentials);

        client
            .simple_bind("cn=testy,o=testers,c=test", "iLike2test")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_search_gated_until_bind() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", SearchSimple);
        let (_quit, _) = spawn_server(26392, server);

        let mut client = connect_client(26392).await;
        let err = client.search(subtree_search("o=testers,c=test")).await.unwrap_err();
        assert_eq!(result_code(err), ResultCode::OperationsError);

        client.simple_bind("", "").await.unwrap();
        let result = client.search(subtree_search("o=testers,c=test")).await.unwrap();
        assert_eq!(result.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_bind_panic_contained() {
        let mut server = LdapServer::new();
        server.bind_fn("o=panic,c=test", BindPanic).bind_fn("", BindAnonOk);
        let (_quit, _) = spawn_server(26393, server);

        let mut client = connect_client(26393).await;
        let err = client.simple_bind("cn=x,o=panic,c=test", "pw").await.unwrap_err();
        assert_eq!(result_code(err), ResultCode::OperationsError);

        // same session keeps serving
        client.simple_bind("", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_search_panic_contained() {
        let mut server = LdapServer::new();
        server
            .bind_fn("", BindAnonOk)
            .search_fn("o=panic,c=test", SearchPanic)
            .search_fn("", SearchSimple);
        let (_quit, _) = spawn_server(26394, server);

        let mut client = connect_client(26394).await;
        client.simple_bind("", "").await.unwrap();

        let err = client.search(subtree_search("o=panic,c=test")).await.unwrap_err();
        assert_eq!(result_code(err), ResultCode::OperationsError);

        let result = client.search(subtree_search("o=testers,c=test")).await.unwrap();
        assert_eq!(result.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_longest_suffix_routing() {
        let mut server = LdapServer::new();
        server
            .bind_fn("", BindAnonOk)
            .search_fn("", SearchNamed("cn=catchall"))
            .search_fn("o=x", SearchNamed("cn=specific,o=x"));
        let (_quit, _) = spawn_server(26395, server);

        let mut client = connect_client(26395).await;
        client.simple_bind("", "").await.unwrap();

        let result = client.search(subtree_search("cn=a,o=x")).await.unwrap();
        assert_eq!(result.entries[0].dn, "cn=specific,o=x");

        let result = client.search(subtree_search("o=y")).await.unwrap();
        assert_eq!(result.entries[0].dn, "cn=catchall");
    }

    #[tokio::test]
    async fn test_stats() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", SearchSimple).set_stats(true);
        let (_quit, stats) = spawn_server(26396, server);

        let mut client = connect_client(26396).await;
        client.simple_bind("", "").await.unwrap();
        client.search(subtree_search("o=testers,c=test")).await.unwrap();

        let snapshot = stats.get();
        assert_eq!(snapshot.conns, 1);
        assert_eq!(snapshot.binds, 1);
        assert_eq!(snapshot.searches, 1);
    }

    #[tokio::test]
    async fn test_multiplexed_searches_one_connection() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", SearchSimple);
        let (_quit, _) = spawn_server(26397, server);

        let mut client = connect_client(26397).await;
        client.simple_bind("", "").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let mut client = client.clone();
            tasks.push(tokio::spawn(async move {
                let request = SearchRequest::builder()
                    .base_dn("o=testers,c=test")
                    .scope(SearchScope::WholeSubtree)
                    .filter(format!("(uid=user{i})"))
                    .build()
                    .unwrap();
                client.search(request).await.unwrap()
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert_eq!(result.entries.len(), 3);
            assert_eq!(result.entries[0].dn, "cn=ned,o=testers,c=test");
        }
    }

    #[tokio::test]
    async fn test_paged_search_matches_unpaged() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", PagedDirectory);
        let (_quit, _) = spawn_server(26398, server);

        let mut client = connect_client(26398).await;
        client.simple_bind("", "").await.unwrap();

        let unpaged = client.search(subtree_search("o=paged,c=test")).await.unwrap();
        assert_eq!(unpaged.entries.len(), 5);

        for page_size in [1u32, 2, 5, 7] {
            let paged: SearchResult = client
                .search_with_paging(subtree_search("o=paged,c=test"), page_size)
                .await
                .unwrap();
            assert_eq!(paged, unpaged, "page size {page_size}");
        }
    }

    #[tokio::test]
    async fn test_compare() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).compare_fn("", CompareCn);
        let (_quit, _) = spawn_server(26399, server);

        let mut client = connect_client(26399).await;
        client.simple_bind("", "").await.unwrap();

        let matched = client
            .compare("uid=qa,ou=users,dc=debian,dc=org", "cn", "Debian QA")
            .await
            .unwrap();
        assert!(matched);

        let matched = client
            .compare("uid=qa,ou=users,dc=debian,dc=org", "cn", "foobar")
            .await
            .unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn test_write_operations() {
        let mut server = LdapServer::new();
        server
            .bind_fn("", BindAnonOk)
            .add_fn("", RecordingOps)
            .modify_fn("", RecordingOps)
            .delete_fn("", RecordingOps)
            .modify_dn_fn("", RecordingOps);
        let (_quit, _) = spawn_server(26400, server);

        let mut client = connect_client(26400).await;
        client.simple_bind("", "").await.unwrap();

        client
            .add("cn=new,o=testers,c=test", vec![Attribute::new("cn", ["new"])])
            .await
            .unwrap();
        client
            .modify(
                "cn=new,o=testers,c=test",
                vec![crate::proto::ModifyChange::replace(crate::proto::PartialAttribute::new(
                    "description",
                    ["updated"],
                ))],
            )
            .await
            .unwrap();
        client.delete("cn=new,o=testers,c=test").await.unwrap();
        client
            .modify_dn("cn=new,o=testers,c=test", "cn=renamed", true, None)
            .await
            .unwrap();

        let err = client.delete("cn=missing,o=testers,c=test").await.unwrap_err();
        assert_eq!(result_code(err), ResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_unsupported_op_answered_with_unwilling() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk);
        let (_quit, _) = spawn_server(26401, server);

        let mut stream = raw_connect(26401).await;
        // application tag 29 is not an LDAP operation
        let packet = Packet::sequence(vec![Packet::integer(5), Packet::application_primitive(29, Bytes::new())]);
        stream.write_all(&ber::encode(&packet)).await.unwrap();

        let reply = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap();
        let msg = LdapMessage::from_packet(reply).unwrap();
        assert_eq!(msg.message_id, 5);
        match msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::UnwillingToPerform);
            }
            other => panic!("expected ExtendedResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_framing_closes_session() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk);
        let (_quit, _) = spawn_server(26402, server);

        let mut stream = raw_connect(26402).await;
        // a top-level INTEGER is not an LDAPMessage
        stream.write_all(&[0x02, 0x01, 0x01]).await.unwrap();

        let err = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_abandon_is_best_effort() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).abandon_fn("", AbandonFlag(flag.clone()));
        let (_quit, _) = spawn_server(26403, server);

        let mut stream = raw_connect(26403).await;

        // anonymous bind
        let bind = LdapMessage::new(1, ProtocolOp::BindRequest(BindRequest::simple("", "")));
        stream.write_all(&ber::encode(&bind.to_packet())).await.unwrap();
        let reply = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap();
        let msg = LdapMessage::from_packet(reply).unwrap();
        assert!(matches!(msg.protocol_op, ProtocolOp::BindResponse(_)));

        // abandon produces no response; the session keeps serving
        let abandon = LdapMessage::new(2, ProtocolOp::AbandonRequest(1));
        stream.write_all(&ber::encode(&abandon.to_packet())).await.unwrap();

        let bind = LdapMessage::new(3, ProtocolOp::BindRequest(BindRequest::simple("", "")));
        stream.write_all(&ber::encode(&bind.to_packet())).await.unwrap();
        let reply = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap();
        let msg = LdapMessage::from_packet(reply).unwrap();
        assert_eq!(msg.message_id, 3);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_quit_channel_stops_accepting() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk);
        let (quit, _) = spawn_server(26404, server);

        // existing session outlives the listener
        let mut client = connect_client(26404).await;
        client.simple_bind("", "").await.unwrap();

        quit.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect(("127.0.0.1", 26404)).await.is_err());
        // the already-accepted session still answers
        client.simple_bind("", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_ldaps_bind_and_search() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk).search_fn("", SearchSimple);
        let _quit = spawn_tls_server(26405, server);

        let mut client = connect_client_with(26405, insecure_tls).await;
        client.simple_bind("", "").await.unwrap();
        let result = client.search(subtree_search("o=testers,c=test")).await.unwrap();
        assert_eq!(result.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_start_tls_upgrade_end_to_end() {
        let mut server = LdapServer::new();
        server
            .bind_fn("", BindAnonOk)
            .search_fn("", SearchSimple)
            .tls_identity(test_identity());
        let (_quit, _) = spawn_server(26406, server);

        // the client negotiates the upgrade on the plain listener, then
        // binds and searches over the secured stream
        let mut client = connect_client_with(26406, insecure_start_tls).await;
        client.simple_bind("", "").await.unwrap();
        let result = client.search(subtree_search("o=testers,c=test")).await.unwrap();
        assert_eq!(result.entries.len(), 3);
    }

    #[tokio::test]
    async fn test_start_tls_without_identity_is_refused() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk);
        let (_quit, _) = spawn_server(26407, server);

        let mut stream = raw_connect(26407).await;
        let req = LdapMessage::new(
            1,
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                name: oid::STARTTLS_OID.to_owned(),
                value: None,
            }),
        );
        stream.write_all(&ber::encode(&req.to_packet())).await.unwrap();

        let reply = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap();
        let msg = LdapMessage::from_packet(reply).unwrap();
        assert_eq!(msg.message_id, 1);
        match msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::UnwillingToPerform);
            }
            other => panic!("expected ExtendedResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_tls_on_secured_session_is_rejected() {
        let mut server = LdapServer::new();
        server.bind_fn("", BindAnonOk);
        let _quit = spawn_tls_server(26408, server);

        let tcp = raw_connect(26408).await;
        let mut builder = native_tls::TlsConnector::builder();
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
        let connector = tokio_native_tls::TlsConnector::from(builder.build().unwrap());
        let mut stream = connector.connect("127.0.0.1", tcp).await.unwrap();

        let req = LdapMessage::new(
            1,
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                name: oid::STARTTLS_OID.to_owned(),
                value: None,
            }),
        );
        stream.write_all(&ber::encode(&req.to_packet())).await.unwrap();

        let reply = ber::read_packet(&mut stream, DEFAULT_MAX_PACKET_SIZE).await.unwrap();
        let msg = LdapMessage::from_packet(reply).unwrap();
        match msg.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                assert_eq!(resp.result.result_code, ResultCode::OperationsError);
            }
            other => panic!("expected ExtendedResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_route_longest_match_unit() {
        let table: Vec<(Dn, Arc<dyn SearchHandler>)> = vec![
            (Dn::parse("").unwrap(), Arc::new(SearchNamed("catchall"))),
            (Dn::parse("o=x").unwrap(), Arc::new(SearchNamed("o=x"))),
            (Dn::parse("ou=a,o=x").unwrap(), Arc::new(SearchNamed("ou=a,o=x"))),
        ];
        let pick = |dn: &str| {
            let info = SessionInfo {
                peer_addr: "127.0.0.1:0".parse().unwrap(),
                tls: false,
            };
            route(&table, &Dn::parse(dn).unwrap())
                .map(|h| h.search("", &subtree_search(""), &[], &info).entries[0].dn.clone())
        };
        assert_eq!(pick("cn=u,ou=a,o=x").as_deref(), Some("ou=a,o=x"));
        assert_eq!(pick("cn=u,ou=b,o=x").as_deref(), Some("o=x"));
        assert_eq!(pick("o=y").as_deref(), Some("catchall"));
    }
}
