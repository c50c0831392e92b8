//! CSTP tunnel server: the AnyConnect/OpenConnect-compatible HTTPS front
//! door plus the binary tunnel protocol it upgrades into.
//!
//! A connection starts as plain HTTPS (login form, auth POST) and, once a
//! session cookie validates, switches to a framed byte stream carrying raw
//! IP packets (`CONNECT /CSCOSSLC/tunnel`). One task per TCP connection
//! owns the read side; a second task per established tunnel owns
//! serialized writes back to the client.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::accounting::AccountingSession;
use crate::auth::{AuthenticationInfo, AuthenticationManager, LoginFailTracker};
use crate::buffer::StreamBuffer;
use crate::crypto::AeadCodec;
use crate::dispatcher::Dispatcher;
use crate::hashlist::HashList;
use crate::ippool::IpPool;
use crate::nic::{Nic, NicKind, TransferStat};
use crate::packet::PacketDescriptor;

const MAX_READ_BUFFER: usize = 16_384;
const CSTP_HEADER_LEN: usize = 8;
const COOKIE_MAGIC: u32 = 0x1981_0211;
const COOKIE_CONTEXT_NAME: &str = "webvpncontext";
const COOKIE_KEY_NAME: &str = "webvpn";

mod frame_type {
    pub const DATA: u8 = 0x00;
    pub const DPD_REQ: u8 = 0x03;
    pub const DPD_RESP: u8 = 0x04;
    pub const DISCONNECT: u8 = 0x05;
    pub const KEEPALIVE: u8 = 0x07;
    #[allow(dead_code)]
    pub const COMPRESSED: u8 = 0x08;
    pub const TERMINATE: u8 = 0x09;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    None,
    AuthRequest,
    Authorized,
    Established,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormType {
    Login,
    Registration,
}

#[derive(Debug, Error)]
pub enum CstpError {
    #[error("tls error: {0}")]
    Tls(#[from] std::io::Error),
}

/// Runtime configuration for one CSTP listener, the fields that end up in
/// `X-CSTP-*` establish-response headers.
#[derive(Debug, Clone)]
pub struct CstpConfig {
    pub address: String,
    pub cert_file: String,
    pub key_file: String,
    pub dpd_interval: u16,
    pub client_netmask: String,
    pub client_mask_len: u32,
    pub split_tunnels: Vec<String>,
    pub dns_servers: Vec<String>,
    pub tunnel_all_dns: bool,
    pub keepalive: u32,
    pub idle_timeout: u32,
    pub rekey_interval: u32,
    pub mtu: u32,
    pub inactive_session_timeout: i64,
    pub login_fail_track_time: i64,
    pub login_fail_count: u32,
}

#[derive(Serialize, Deserialize)]
struct ContextCookie {
    form_type: u8,
    random_counter: u32,
    magic: u32,
}

#[derive(Serialize, Deserialize)]
struct KeyCookie {
    user_name: String,
    authenticator: String,
    client_ip: String,
    virtual_ip: String,
    session_id: u64,
    random_counter: u32,
    magic: u32,
}

#[derive(Clone, Copy)]
struct SessionInfo {
    virtual_ip: IpAddr,
}

/// The shared, per-listener state: certificate fingerprint, cookie keys,
/// the active-session table, and every collaborator the HTTP/tunnel
/// handshake needs (auth, IP allocation, NIC registration, forwarding).
pub struct CstpServer {
    config: CstpConfig,
    cookie_cipher: AeadCodec,
    random_counter: u32,
    session_counter: AtomicU64,
    active_sessions: HashList<SessionInfo>,
    cert_fingerprint_hex: String,
    tls_acceptor: TlsAcceptor,
    auth: Arc<AuthenticationManager>,
    ip_pool: Arc<IpPool>,
    nics: Arc<crate::nic::NicManager>,
    dispatcher: Arc<Dispatcher>,
    next_nic_id: AtomicU64,
    login_fail: LoginFailTracker,
}

impl CstpServer {
    pub fn new(
        config: CstpConfig,
        auth: Arc<AuthenticationManager>,
        ip_pool: Arc<IpPool>,
        nics: Arc<crate::nic::NicManager>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>, CstpError> {
        let cert_chain = load_certs(&config.cert_file)?;
        let key = load_key(&config.key_file)?;
        let fingerprint = sha1_fingerprint(&cert_chain[0]);

        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

        let login_fail = LoginFailTracker::new(config.login_fail_track_time, config.login_fail_count);
        Ok(Arc::new(Self {
            config,
            cookie_cipher: AeadCodec::new(),
            random_counter: rand::thread_rng().next_u32(),
            session_counter: AtomicU64::new(0),
            active_sessions: HashList::new(32_000),
            cert_fingerprint_hex: fingerprint,
            tls_acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            auth,
            ip_pool,
            nics,
            dispatcher,
            next_nic_id: AtomicU64::new(1),
            login_fail,
        }))
    }

    /// Bind and accept connections until the listener errors out.
    pub async fn run(self: Arc<Self>) -> Result<(), CstpError> {
        let listener = TcpListener::bind(&self.config.address).await?;
        tracing::info!(address = %self.config.address, "cstp listener started");
        loop {
            let (socket, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(socket, peer.ip()).await {
                    tracing::debug!(%peer, %err, "cstp connection ended");
                }
            });
        }
    }

    /// Sweep one segment of the active-session table for sessions whose
    /// key cookie hasn't validated (and so refreshed `last_access`) within
    /// the inactivity window, freeing their virtual IP back to the pool.
    pub fn sweep_sessions(&self) {
        let removed_ips = std::sync::Mutex::new(Vec::new());
        self.active_sessions.check_for_timeout(
            Some(|info: &SessionInfo, _delta: i64| {
                removed_ips.lock().unwrap().push(info.virtual_ip);
                true
            }),
            self.config.inactive_session_timeout,
        );
        for ip in removed_ips.into_inner().unwrap() {
            self.ip_pool.free(ip);
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: tokio::net::TcpStream, client_ip: IpAddr) -> Result<(), CstpError> {
        let tls_stream = self.tls_acceptor.accept(socket).await?;
        let (mut read_half, write_half) = tokio::io::split(tls_stream);

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_task = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(chunk) = rx.recv().await {
                if write_half.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut buffer = StreamBuffer::new(MAX_READ_BUFFER);
        let mut status = SessionStatus::None;
        let mut established: Option<EstablishedState> = None;
        let mut read_chunk = vec![0u8; MAX_READ_BUFFER];

        loop {
            let n = read_half.read(&mut read_chunk).await?;
            if n == 0 {
                break;
            }
            if buffer.write(&read_chunk[..n]).is_err() {
                tracing::warn!("cstp read buffer overflow");
                break;
            }

            if status == SessionStatus::Established {
                let state = established.as_ref().expect("established status implies state");
                match self.read_tunnel_frames(&mut buffer, state, &tx) {
                    FrameLoopResult::Continue => continue,
                    FrameLoopResult::Disconnect => break,
                }
            }

            let Some(request) = parse_http_request(&mut buffer) else {
                continue;
            };

            let response = self
                .process_http_request(&request, client_ip, &mut status, &mut established, &tx)
                .await;
            if tx.send(response).is_err() {
                break;
            }
            if status == SessionStatus::Invalid {
                break;
            }
        }

        // The registered NIC (if any) holds its own clone of `tx`; drop it
        // via teardown before dropping ours, otherwise the writer task's
        // `rx.recv()` never observes a closed channel and never returns.
        if let Some(state) = established {
            self.teardown(state).await;
        }
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    fn read_tunnel_frames(
        &self,
        buffer: &mut StreamBuffer,
        state: &EstablishedState,
        tx: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> FrameLoopResult {
        loop {
            if buffer.unread_size() < CSTP_HEADER_LEN {
                buffer.remove_read();
                return FrameLoopResult::Continue;
            }
            let header = buffer.read_n(CSTP_HEADER_LEN).to_vec();
            if &header[0..3] != b"STF" || header[3] != 1 {
                return FrameLoopResult::Disconnect;
            }
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let kind = header[6];
            if len as u32 > self.config.mtu + 16 {
                return FrameLoopResult::Disconnect;
            }
            if buffer.unread_size() < len {
                buffer.seek(buffer.used_size() - buffer.unread_size() - CSTP_HEADER_LEN);
                return FrameLoopResult::Continue;
            }
            let body = buffer.read_n(len).to_vec();

            match kind {
                frame_type::DATA => {
                    if let Some(mut packet) = PacketDescriptor::parse(body) {
                        packet.in_nic = state.nic_id;
                        packet.client_ip = Some(state.client_ip);
                        packet.client_virtual_ip = Some(state.virtual_ip);
                        state.stats.add_receive(packet.used_size() as u64);
                        state.accounting.add_transfer(packet.used_size() as u64, true);
                        self.dispatcher.dispatch(packet);
                    }
                }
                frame_type::DPD_REQ => {
                    let _ = tx.send(make_cstp_frame(&[], frame_type::DPD_RESP));
                }
                frame_type::KEEPALIVE => {
                    let _ = tx.send(make_cstp_frame(&[], frame_type::KEEPALIVE));
                }
                frame_type::DISCONNECT | frame_type::TERMINATE => {
                    return FrameLoopResult::Disconnect;
                }
                _ => {}
            }
            buffer.remove_read();
        }
    }

    async fn process_http_request(
        &self,
        request: &HttpRequest,
        client_ip: IpAddr,
        status: &mut SessionStatus,
        established: &mut Option<EstablishedState>,
        tx: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> Vec<u8> {
        let agent = agent_kind(request.header("user-agent").unwrap_or(""));

        if agent == AgentKind::Other {
            *status = SessionStatus::Invalid;
            return http_response(401, "text/plain", "unsupported client");
        }

        let current_status = self.derive_status(request, client_ip);
        match current_status {
            SessionStatus::Invalid => {
                *status = SessionStatus::Invalid;
                http_response(401, "text/plain", "invalid session")
            }
            SessionStatus::None => {
                *status = SessionStatus::None;
                self.generate_init_response(FormType::Login)
            }
            SessionStatus::AuthRequest => {
                *status = SessionStatus::AuthRequest;
                self.generate_auth_response(request, client_ip, agent).await
            }
            SessionStatus::Authorized => {
                if request.method.eq_ignore_ascii_case("CONNECT") {
                    match self.establish(request, client_ip, tx.clone()) {
                        Some((state, response)) => {
                            *status = SessionStatus::Established;
                            *established = Some(state);
                            response
                        }
                        None => {
                            *status = SessionStatus::Invalid;
                            http_response(401, "text/plain", "establish failed")
                        }
                    }
                } else {
                    *status = SessionStatus::Authorized;
                    self.generate_get_response(request)
                }
            }
            SessionStatus::Established => unreachable!("handled by the frame loop"),
        }
    }

    fn derive_status(&self, request: &HttpRequest, client_ip: IpAddr) -> SessionStatus {
        if let Some(key_cookie) = request.cookie(COOKIE_KEY_NAME) {
            return if self.is_valid_key(key_cookie, client_ip) {
                SessionStatus::Authorized
            } else {
                SessionStatus::Invalid
            };
        }
        if let Some(context_cookie) = request.cookie(COOKIE_CONTEXT_NAME) {
            return if self.is_valid_context(context_cookie) {
                SessionStatus::AuthRequest
            } else {
                SessionStatus::Invalid
            };
        }
        SessionStatus::None
    }

    fn is_valid_context(&self, cookie_value: &str) -> bool {
        self.decode_context_cookie(cookie_value).is_some()
    }

    fn decode_context_cookie(&self, value: &str) -> Option<ContextCookie> {
        let cookie: ContextCookie = self.cookie_cipher.decrypt(value)?;
        if cookie.magic != COOKIE_MAGIC || cookie.random_counter != self.random_counter {
            return None;
        }
        Some(cookie)
    }

    fn decode_key_cookie(&self, value: &str) -> Option<KeyCookie> {
        let cookie: KeyCookie = self.cookie_cipher.decrypt(value)?;
        if cookie.magic != COOKIE_MAGIC || cookie.random_counter != self.random_counter {
            return None;
        }
        Some(cookie)
    }

    fn is_valid_key(&self, cookie_value: &str, client_ip: IpAddr) -> bool {
        self.sweep_sessions();
        let Some(key) = self.decode_key_cookie(cookie_value) else {
            return false;
        };
        if key.client_ip != client_ip.to_string() {
            return false;
        }
        // with_mut refreshes last_access on the matching node even though the
        // closure itself does nothing; a missing node means the session was
        // already swept as inactive or never existed.
        self.active_sessions.with_mut(key.session_id, |_: &mut SessionInfo| {}).is_some()
    }

    fn generate_context_cookie(&self, form_type: FormType) -> String {
        let cookie = ContextCookie {
            form_type: form_type as u8,
            random_counter: self.random_counter,
            magic: COOKIE_MAGIC,
        };
        format!("{COOKIE_CONTEXT_NAME}={}", self.cookie_cipher.encrypt(&cookie))
    }

    fn generate_key_cookie(&self, user: &str, authenticator: &str, client_ip: IpAddr, virtual_ip: IpAddr, session_id: u64) -> String {
        let cookie = KeyCookie {
            user_name: user.to_string(),
            authenticator: authenticator.to_string(),
            client_ip: client_ip.to_string(),
            virtual_ip: virtual_ip.to_string(),
            session_id,
            random_counter: self.random_counter,
            magic: COOKIE_MAGIC,
        };
        format!("{COOKIE_KEY_NAME}={}", self.cookie_cipher.encrypt(&cookie))
    }

    fn generate_init_response(&self, form_type: FormType) -> Vec<u8> {
        let (action, message, extra_input) = match form_type {
            FormType::Login => ("auth", "Please enter your username and password.", ""),
            FormType::Registration => ("register", "Please enter your information", r#"<input type="text" name="phone" label="Phone:" />"#),
        };
        let mut inputs = r#"<input type="text" name="username" label="Username:" />"#.to_string();
        if form_type == FormType::Login {
            inputs.push_str(r#"<input type="password" name="password" label="Password:" />"#);
        } else {
            inputs.push_str(extra_input);
        }
        let body = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<config-auth client=\"vpn\" type=\"auth-request\">\n\t<version who=\"sg\">0.1(1)</version>\n\t<auth id=\"main\">\n\t\t<message> {message} </message>\n\t\t<form method=\"post\" action=\"/{action}\">\n\t\t\t{inputs}\n\t\t</form>\n\t</auth>\n</config-auth>\n"
        );
        let mut resp = HttpResponseBuilder::new(200, "text/xml", &body);
        resp.add_header("Set-Cookie", &self.generate_context_cookie(form_type));
        resp.add_header("X-Transcend-Version", "1");
        resp.build()
    }

    async fn generate_auth_response(&self, request: &HttpRequest, client_ip: IpAddr, agent: AgentKind) -> Vec<u8> {
        let Some(context_value) = request.cookie(COOKIE_CONTEXT_NAME) else {
            return http_response(401, "text/plain", "invalid request");
        };
        let Some(context) = self.decode_context_cookie(context_value) else {
            return http_response(401, "text/plain", "invalid request");
        };
        let parsed = match agent {
            AgentKind::OpenConnect => parse_auth_xml(request),
            _ => parse_auth_form(request),
        };
        let Some((user, password)) = parsed else {
            return http_response(401, "text/plain", "invalid request");
        };

        if context.form_type == FormType::Registration as u8 {
            return self.generate_init_response(FormType::Login);
        }

        if !self.login_fail.can_login(&client_ip.to_string()) {
            return http_response(401, "text/plain", "ip blocked");
        }

        let info = AuthenticationInfo { ip: client_ip, user: user.clone(), password };
        let authenticator = match self.auth.authenticate_user(&info) {
            Ok(auth) => auth,
            Err(err) => {
                self.login_fail.register_fail(&client_ip.to_string());
                return http_response(401, "text/plain", &err.to_string());
            }
        };

        let Some((session_id, virtual_ip)) = self.generate_session_id() else {
            return http_response(401, "text/plain", "out of IP");
        };

        let key_cookie = self.generate_key_cookie(&user, authenticator.kind(), client_ip, virtual_ip, session_id);
        let context_cookie = self.generate_context_cookie(FormType::Login);

        let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<config-auth client=\"vpn\" type=\"complete\">\n<version who=\"sg\">0.1(1)</version>\n<auth id=\"success\">\n<title>SSL VPN Service</title></auth></config-auth>";

        let cert_hex = self.cert_fingerprint_hex.to_uppercase();
        let mut resp = HttpResponseBuilder::new(200, "text/xml", body);
        resp.add_header("Set-Cookie", &key_cookie);
        resp.add_header("Set-Cookie", &context_cookie);
        resp.add_header("Set-Cookie", "webvpnc=; expires=Thu, 01 Jan 1970 22:00:00 GMT; path=/; Secure");
        resp.add_header("Set-Cookie", &format!("webvpnc=bu:/&p:t&iu:1/&sh:{cert_hex}; path=/; Secure"));
        resp.add_header("X-Transcend-Version", "1");
        resp.build()
    }

    fn generate_get_response(&self, request: &HttpRequest) -> Vec<u8> {
        match request.path.as_str() {
            "/1/binaries/update.txt" => http_response(200, "text/html", "0,00,000\n"),
            "/1/binaries/vpndownloader.exe" => http_response(404, "text/html", "<html><body><h1>404 Not Found</h1></body></html>\n"),
            _ => http_response(200, "text/html", "<html></html>\n"),
        }
    }

    fn generate_session_id(&self) -> Option<(u64, IpAddr)> {
        let ip = self.ip_pool.allocate()?;
        let id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.active_sessions.add(id, SessionInfo { virtual_ip: ip });
        Some((id, ip))
    }

    fn remove_session_id(&self, id: u64) {
        if let Some(info) = self.active_sessions.find::<fn(&SessionInfo) -> bool>(id, None) {
            self.ip_pool.free(info.virtual_ip);
        }
        self.active_sessions.remove::<fn(&SessionInfo) -> bool>(id, None);
    }

    fn establish(
        &self,
        request: &HttpRequest,
        client_ip: IpAddr,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Option<(EstablishedState, Vec<u8>)> {
        let key_value = request.cookie(COOKIE_KEY_NAME)?;
        let key = self.decode_key_cookie(key_value)?;

        let nic_id = self.next_nic_id.fetch_add(1, Ordering::Relaxed);
        let virtual_ip: IpAddr = key.virtual_ip.parse().ok()?;
        let accounting_session_id = crate::accounting::random_session_id();

        let accounting = self.auth.create_session(
            &key.authenticator,
            accounting_session_id.clone(),
            key.user_name.clone(),
            client_ip,
            virtual_ip,
        );
        let stats = Arc::new(TransferStat::default());

        let nic = Arc::new(CstpClientNic {
            id: nic_id,
            name: format!("ssl-vpn-{}", key.user_name),
            client_ip,
            virtual_ip,
            mask_len: self.config.client_mask_len,
            sender: tx,
            stats: stats.clone(),
            accounting: accounting.clone(),
        });
        self.nics.register_nic(nic);

        let response = self.generate_establish_response(&key.virtual_ip);

        let state = EstablishedState {
            session_id: key.session_id,
            accounting_session_id,
            nic_id,
            client_ip,
            virtual_ip,
            accounting,
            stats,
        };
        Some((state, response))
    }

    fn generate_establish_response(&self, virtual_ip: &str) -> Vec<u8> {
        let mut resp = HttpResponseBuilder::connected();
        resp.add_header("X-CSTP-Version", "1");
        resp.add_header("X-CSTP-Server-Name", "goconnect-rs");
        resp.add_header("X-CSTP-Hostname", "goconnect-rs");
        resp.add_header("X-CSTP-DPD", &self.config.dpd_interval.to_string());
        resp.add_header("X-CSTP-Address", virtual_ip);
        resp.add_header("X-CSTP-Netmask", &self.config.client_netmask);
        for split in &self.config.split_tunnels {
            resp.add_header("X-CSTP-Split-Include", split);
        }
        resp.add_header("X-CSTP-Tunnel-All-DNS", if self.config.tunnel_all_dns { "true" } else { "false" });
        resp.add_header("X-CSTP-Keepalive", &self.config.keepalive.to_string());
        if self.config.idle_timeout != 0 {
            resp.add_header("X-CSTP-Idle-Timeout", &self.config.idle_timeout.to_string());
        }
        resp.add_header("X-CSTP-Rekey-Time", &self.config.rekey_interval.to_string());
        resp.add_header("X-CSTP-Rekey-Method", "ssl");
        resp.add_header("X-CSTP-Session-Timeout", "none");
        resp.add_header("X-CSTP-Disconnected-Timeout", "none");
        resp.add_header("X-CSTP-Keep", "true");
        resp.add_header("X-CSTP-TCP-Keepalive", "true");
        resp.add_header("X-CSTP-License", "accept");
        resp.add_header("X-CSTP-Base-MTU", "1500");
        resp.add_header("X-CSTP-MTU", &self.config.mtu.to_string());
        for dns in &self.config.dns_servers {
            resp.add_header("X-CSTP-DNS", dns);
        }
        resp.build()
    }

    async fn teardown(&self, state: EstablishedState) {
        self.nics.remove_nic(state.nic_id);
        self.auth.accounting.remove(&state.accounting_session_id);
        self.remove_session_id(state.session_id);
    }
}

enum FrameLoopResult {
    Continue,
    Disconnect,
}

struct EstablishedState {
    session_id: u64,
    accounting_session_id: String,
    nic_id: u64,
    client_ip: IpAddr,
    virtual_ip: IpAddr,
    accounting: Arc<AccountingSession>,
    stats: Arc<TransferStat>,
}

/// The per-connection NIC installed with [`crate::nic::NicManager`] once a
/// tunnel is established. Writes are handed to the connection's writer
/// task over a channel rather than touching the socket directly, so the
/// dispatcher never blocks on TLS I/O.
pub struct CstpClientNic {
    id: u64,
    name: String,
    client_ip: IpAddr,
    virtual_ip: IpAddr,
    mask_len: u32,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    stats: Arc<TransferStat>,
    accounting: Arc<AccountingSession>,
}

impl Nic for CstpClientNic {
    fn id(&self) -> u64 {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> NicKind {
        NicKind::Client
    }
    fn peer_ip(&self) -> Option<IpAddr> {
        Some(self.client_ip)
    }
    fn virtual_ip(&self) -> Option<IpAddr> {
        Some(self.virtual_ip)
    }
    fn routes(&self) -> Vec<(IpAddr, u32)> {
        vec![(self.virtual_ip, self.mask_len)]
    }
    fn write_data(&self, packet: &PacketDescriptor) {
        let frame = make_cstp_frame(packet.raw(), frame_type::DATA);
        if self.sender.send(frame).is_ok() {
            self.stats.add_send(packet.used_size() as u64);
            self.accounting.add_transfer(packet.used_size() as u64, false);
        }
    }
    fn end(&self) {
        let _ = self.sender.send(make_cstp_frame(&[], frame_type::TERMINATE));
    }
    fn stats(&self) -> &TransferStat {
        &self.stats
    }
}

fn make_cstp_frame(payload: &[u8], kind: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CSTP_HEADER_LEN + payload.len());
    frame.extend_from_slice(b"STF");
    frame.push(1);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.push(kind);
    frame.push(0);
    frame.extend_from_slice(payload);
    frame
}

#[derive(Debug, PartialEq, Eq)]
enum AgentKind {
    OpenConnect,
    CiscoAnyConnect,
    Other,
}

fn agent_kind(user_agent: &str) -> AgentKind {
    if user_agent.contains("Open AnyConnect") || user_agent.contains("OpenConnect-GUI") {
        AgentKind::OpenConnect
    } else if user_agent.contains("AnyConnect") {
        AgentKind::CiscoAnyConnect
    } else {
        AgentKind::Other
    }
}

struct HttpRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        let raw = self.header("cookie")?;
        raw.split(';').map(str::trim).find_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            (k == name).then_some(v)
        })
    }
}

/// Parse one buffered HTTP request (header terminator plus any declared
/// body), consuming exactly that much of `buffer`. Returns `None` when the
/// buffer doesn't yet hold a complete request, rewinding the read cursor.
fn parse_http_request(buffer: &mut StreamBuffer) -> Option<HttpRequest> {
    let Some(raw_header) = buffer.read_until(b"\r\n\r\n") else {
        buffer.seek(0);
        return None;
    };
    let data = raw_header.to_vec();
    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_buf);
    let parsed = req.parse(&data).ok()?;
    if !parsed.is_complete() {
        buffer.seek(0);
        return None;
    }

    let method = req.method.unwrap_or("").to_string();
    let path = req.path.unwrap_or("").to_string();
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
        .collect();

    let content_len: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    let body = if content_len > 0 {
        let body = buffer.read_n(content_len);
        if body.len() != content_len {
            buffer.seek(0);
            return None;
        }
        body.to_vec()
    } else {
        Vec::new()
    };

    buffer.remove_read();
    Some(HttpRequest { method, path, headers, body })
}

fn parse_auth_form(request: &HttpRequest) -> Option<(String, String)> {
    let body = String::from_utf8_lossy(&request.body);
    let mut user = None;
    let mut password = None;
    for pair in body.split('&') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        let decoded = urlencoding_decode(v);
        match k {
            "username" => user = Some(decoded),
            "password" => password = Some(decoded),
            _ => {}
        }
    }
    Some((user?, password.unwrap_or_default()))
}

fn urlencoding_decode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let Ok(byte) = u8::from_str_radix(&format!("{hi}{lo}"), 16) {
                        out.push(byte as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other),
        }
    }
    out
}

/// OpenConnect POSTs `/auth` as XML instead of a form, e.g.
/// `<config-auth><auth><username>bob</username><password>hunter2</password></auth></config-auth>`.
/// Pulls `username`/`password` element text out of that body without a full parser.
fn parse_auth_xml(request: &HttpRequest) -> Option<(String, String)> {
    let body = String::from_utf8_lossy(&request.body);
    let user = xml_tag_text(&body, "username")?;
    let password = xml_tag_text(&body, "password").unwrap_or_default();
    Some((user, password))
}

fn xml_tag_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = start + body[start..].find(&close)?;
    Some(body[start..end].trim().to_string())
}

struct HttpResponseBuilder {
    status_line: String,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponseBuilder {
    fn new(status: u16, content_type: &str, body: &str) -> Self {
        let reason = match status {
            200 => "OK",
            401 => "Unauthorized",
            404 => "Not Found",
            _ => "OK",
        };
        Self {
            status_line: format!("HTTP/1.1 {status} {reason}"),
            content_type: Some(content_type.to_string()),
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn connected() -> Self {
        Self {
            status_line: "HTTP/1.1 200 CONNECTED".to_string(),
            content_type: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn add_header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_string(), value.to_string()));
    }

    fn build(self) -> Vec<u8> {
        let mut out = format!("{}\r\n", self.status_line);
        if let Some(ct) = &self.content_type {
            out.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        for (k, v) in &self.headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn http_response(status: u16, content_type: &str, body: &str) -> Vec<u8> {
    HttpResponseBuilder::new(status, content_type, body).build()
}

fn load_certs(path: &str) -> std::io::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

fn load_key(path: &str) -> std::io::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(data.as_slice());
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "no private key found"))
}

fn sha1_fingerprint(cert: &CertificateDer<'static>) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(cert.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_round_trips_through_aead() {
        let cipher = AeadCodec::new();
        let cookie = ContextCookie {
            form_type: 0,
            random_counter: 42,
            magic: COOKIE_MAGIC,
        };
        let encoded = cipher.encrypt(&cookie);
        let decoded: ContextCookie = cipher.decrypt(&encoded).unwrap();
        assert_eq!(decoded.random_counter, 42);
        assert_eq!(decoded.magic, COOKIE_MAGIC);
    }

    #[test]
    fn cookie_decrypt_rejects_tampered_payload() {
        let cipher = AeadCodec::new();
        let cookie = ContextCookie { form_type: 0, random_counter: 1, magic: COOKIE_MAGIC };
        let mut encoded = cipher.encrypt(&cookie);
        encoded.push('A');
        assert!(cipher.decrypt::<ContextCookie>(&encoded).is_none());
    }

    #[test]
    fn frame_header_round_trips() {
        let frame = make_cstp_frame(b"hello", frame_type::DATA);
        assert_eq!(&frame[0..3], b"STF");
        assert_eq!(frame[3], 1);
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 5);
        assert_eq!(frame[6], frame_type::DATA);
    }

    #[test]
    fn agent_kind_detects_openconnect_and_anyconnect() {
        assert_eq!(agent_kind("Open AnyConnect VPN Agent"), AgentKind::OpenConnect);
        assert_eq!(agent_kind("AnyConnect Linux_64 4.9"), AgentKind::CiscoAnyConnect);
        assert_eq!(agent_kind("curl/8.0"), AgentKind::Other);
    }

    #[test]
    fn auth_form_parses_url_encoded_body() {
        let req = HttpRequest {
            method: "POST".into(),
            path: "/auth".into(),
            headers: vec![],
            body: b"username=dummy&password=hello%20world".to_vec(),
        };
        let (user, password) = parse_auth_form(&req).unwrap();
        assert_eq!(user, "dummy");
        assert_eq!(password, "hello world");
    }

    #[test]
    fn auth_xml_parses_openconnect_body() {
        let req = HttpRequest {
            method: "POST".into(),
            path: "/auth".into(),
            headers: vec![],
            body: b"<config-auth><version>1</version><auth><username>dummy</username><password>hello world</password></auth></config-auth>".to_vec(),
        };
        let (user, password) = parse_auth_xml(&req).unwrap();
        assert_eq!(user, "dummy");
        assert_eq!(password, "hello world");
    }
}
