//! Management HTTP API: a dynamic command-dispatch table behind a
//! token-authenticated login, mirroring the reference implementation's
//! separate management channel (`commander.go`/`command_authenticator.go`).
//!
//! Unlike the source's `ICommanderActor`/`ICommanderSelector` indirection,
//! registered commands here are plain boxed closures — Rust's closures and
//! trait objects already give us what that layer existed to simulate.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::accounting::AccountingRegistry;
use crate::auth::{AuthenticationInfo, AuthenticationManager, LoginFailTracker};
use crate::crypto::AeadCodec;
use crate::flow::{FlowFilter, FlowManager};
use crate::hashlist::HashList;
use crate::router::Router as PacketRouter;

const TOKEN_SEGMENT_COUNT: u32 = 16_000;
const TOKEN_COOKIE_NAME: &str = "token";

/// No-login-required command names, matching the reference implementation's
/// `authNoLoginCommands`.
const NO_LOGIN_COMMANDS: &[&str] = &["login", "login_admin"];

/// Runtime configuration for the management listener.
#[derive(Debug, Clone)]
pub struct CommanderConfig {
    pub bind_address: String,
    pub valid_clients: Vec<IpAddr>,
    pub maintenance_hook: bool,
    pub token_max_life_time: i64,
    pub login_fail_track_time: i64,
    pub login_fail_count: u32,
}

/// A single registered command handler.
type CommandFn = dyn Fn(&CommandContext, Value) -> Result<Value, CommandError> + Send + Sync;

/// Everything a command handler needs about the request that invoked it.
pub struct CommandContext {
    pub client_ip: IpAddr,
    pub identity: Option<TokenIdentity>,
}

#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub username: String,
    pub admin: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

struct RegisteredCommand {
    handler: Box<CommandFn>,
    help: &'static str,
    admin_only: bool,
}

#[derive(Serialize, Deserialize, Clone)]
struct TokenPayload {
    id: u64,
}

struct TokenInfo {
    username: String,
    admin: bool,
    create_time: i64,
    login_ip: IpAddr,
}

/// Owns the command table, the login-token store, and every subsystem a
/// registered command is allowed to read or mutate.
pub struct Commander {
    config: CommanderConfig,
    commands: RwLock<HashMap<String, RegisteredCommand>>,
    token_cipher: AeadCodec,
    token_counter: std::sync::atomic::AtomicU64,
    tokens: HashList<TokenInfo>,
    login_fail: LoginFailTracker,
    auth: Arc<AuthenticationManager>,
}

impl Commander {
    pub fn new(config: CommanderConfig, auth: Arc<AuthenticationManager>) -> Arc<Self> {
        let commander = Arc::new(Self {
            login_fail: LoginFailTracker::new(config.login_fail_track_time, config.login_fail_count),
            config,
            commands: RwLock::new(HashMap::new()),
            token_cipher: AeadCodec::new(),
            token_counter: std::sync::atomic::AtomicU64::new(0),
            tokens: HashList::new(TOKEN_SEGMENT_COUNT),
            auth,
        });
        commander.register_builtin_commands();
        commander
    }

    /// Register a new command. Panics on duplicate registration, matching
    /// the reference implementation's fatal-on-duplicate-route behavior:
    /// a route collision is a programming error, not a runtime condition.
    pub fn register<F>(&self, name: &str, help: &'static str, admin_only: bool, handler: F)
    where
        F: Fn(&CommandContext, Value) -> Result<Value, CommandError> + Send + Sync + 'static,
    {
        let mut commands = self.commands.write();
        if commands.contains_key(name) {
            panic!("duplicate command registration: {name}");
        }
        commands.insert(
            name.to_string(),
            RegisteredCommand { handler: Box::new(handler), help, admin_only },
        );
    }

    fn register_builtin_commands(self: &Arc<Self>) {
        // Weak, not a clone: a strong self-reference here would keep the
        // Commander alive forever even after every other Arc is dropped.
        let weak = Arc::downgrade(self);
        self.register("help", "list registered commands", false, move |_, _| {
            let this = weak.upgrade().ok_or(CommandError::NotFound)?;
            let commands = this.commands.read();
            let mut names: Vec<&str> = commands.keys().map(String::as_str).collect();
            names.sort_unstable();
            let listing: Vec<Value> = names
                .into_iter()
                .map(|name| {
                    let cmd = &commands[name];
                    serde_json::json!({ "name": name, "help": cmd.help, "admin_only": cmd.admin_only })
                })
                .collect();
            Ok(Value::Array(listing))
        });
    }

    /// Wire the `flows_*` admin commands against a live [`FlowManager`].
    pub fn register_flow_commands(self: &Arc<Self>, flows: Arc<FlowManager>) {
        let f = flows.clone();
        self.register("flows_list", "list active flows", false, move |_, params| {
            let filter: FlowFilter = parse_params(params)?;
            Ok(serde_json::to_value(f.list(&filter, "id")).unwrap())
        });

        let f = flows.clone();
        self.register("flows_dc", "disconnect matching flows", true, move |_, params| {
            let filter: FlowFilter = parse_params(params)?;
            Ok(serde_json::json!({ "disconnected": f.disconnect(&filter) }))
        });

        let f = flows;
        self.register("flows_status", "flow manager status", false, move |_, _| {
            Ok(serde_json::to_value(f.status()).unwrap())
        });
    }

    /// Wire the `acc_*` admin commands against a live [`AccountingRegistry`].
    pub fn register_accounting_commands(self: &Arc<Self>, accounting: Arc<AccountingRegistry>) {
        #[derive(Deserialize, Default)]
        struct UserIpFilter {
            #[serde(default)]
            user: Option<String>,
            #[serde(default)]
            ip: Option<IpAddr>,
        }

        let a = accounting.clone();
        self.register("acc_sessions_list", "list active vpn sessions", false, move |_, params| {
            let filter: UserIpFilter = parse_params(params)?;
            Ok(serde_json::to_value(a.list(filter.user.as_deref(), filter.ip)).unwrap())
        });

        let a = accounting.clone();
        self.register("acc_users_list", "list user open-session counts", false, move |_, _| {
            Ok(serde_json::to_value(a.users()).unwrap())
        });

        let a = accounting.clone();
        self.register("acc_sessions_dc", "disconnect sessions for a user", true, move |_, params| {
            #[derive(Deserialize, Default)]
            struct Params {
                #[serde(default)]
                user: Option<String>,
            }
            let params: Params = parse_params(params)?;
            Ok(serde_json::json!({ "disconnected": a.disconnect(params.user.as_deref()) }))
        });

        let a = accounting;
        self.register("acc_sessions_status", "accounting totals", false, move |_, _| {
            let (count, send, receive) = a.status();
            Ok(serde_json::json!({ "session_count": count, "total_send": send, "total_receive": receive }))
        });
    }

    /// Wire a `list` command against a live [`PacketRouter`] under `name`
    /// (e.g. `"routes4_list"`/`"routes6_list"` for the IPv4/IPv6 tables).
    pub fn register_route_commands(self: &Arc<Self>, name: &'static str, router: Arc<PacketRouter>) {
        self.register(name, "list the forwarding table", false, move |_, _| {
            Ok(serde_json::to_value(router.list()).unwrap())
        });
    }

    fn check_access_list(&self, ip: IpAddr) -> bool {
        self.config.valid_clients.is_empty() || self.config.valid_clients.contains(&ip)
    }

    fn create_token(&self, username: &str, ip: IpAddr, admin: bool) -> String {
        let id = self.token_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        self.tokens.add(
            id,
            TokenInfo {
                username: username.to_string(),
                admin,
                create_time: now_unix(),
                login_ip: ip,
            },
        );
        self.token_cipher.encrypt(&TokenPayload { id })
    }

    /// Decrypt and validate a client-presented token: creation IP must
    /// match the requesting IP (a token stolen off the wire is useless from
    /// anywhere else) and the token must be within `token_max_life_time`.
    fn check_token(&self, token: &str, ip: IpAddr) -> Option<TokenIdentity> {
        let payload: TokenPayload = self.token_cipher.decrypt(token)?;
        self.tokens.with_mut(payload.id, |info: &mut TokenInfo| {
            if info.login_ip != ip {
                return None;
            }
            if now_unix() - info.create_time > self.config.token_max_life_time {
                return None;
            }
            Some(TokenIdentity { username: info.username.clone(), admin: info.admin })
        })?
    }

    fn remove_token(&self, token: &str) {
        if let Some(payload) = self.token_cipher.decrypt::<TokenPayload>(token) {
            self.tokens.remove::<fn(&TokenInfo) -> bool>(payload.id, None);
        }
    }

    /// Sweep one segment of the token table for expired entries; call
    /// periodically (the reference implementation sweeps every 10ms, but
    /// its `CheckForTimeOut` equivalent walks every segment each call — here
    /// each call only sweeps one segment, so the caller should loop this
    /// once per segment count per tick to cover the whole table, same
    /// compensation as [`LoginFailTracker::sweep`](crate::auth::LoginFailTracker::sweep)).
    pub fn sweep_tokens(&self) {
        self.tokens
            .check_for_timeout(None::<fn(&TokenInfo, i64) -> bool>, self.config.token_max_life_time);
    }

    fn is_valid_request(&self, command: &str, token: Option<&str>, client_ip: IpAddr) -> Option<Option<TokenIdentity>> {
        if NO_LOGIN_COMMANDS.contains(&command) {
            return Some(None);
        }
        if self.config.maintenance_hook && (client_ip.is_loopback() || client_ip.is_unspecified()) {
            return Some(None);
        }
        let token = token?;
        let identity = self.check_token(token, client_ip)?;
        Some(Some(identity))
    }

    fn handle_login(&self, client_ip: IpAddr, user: String, password: String, admin: bool) -> Result<Value, CommandError> {
        let ip_key = client_ip.to_string();
        if !self.login_fail.can_login(&ip_key) {
            return Err(CommandError::Forbidden("too many failed attempts".into()));
        }
        let info = AuthenticationInfo { ip: client_ip, user: user.clone(), password };
        let result = if admin {
            self.auth.authenticate_admin(&info).map(|_| ()).map_err(|err| err.to_string())
        } else {
            self.auth.authenticate_user(&info).map(|_| ()).map_err(|err| err.to_string())
        };
        match result {
            Ok(()) => {
                let token = self.create_token(&user, client_ip, admin);
                Ok(serde_json::json!({ "token": token }))
            }
            Err(err) => {
                self.login_fail.register_fail(&ip_key);
                Err(CommandError::Forbidden(err))
            }
        }
    }

    fn dispatch(&self, command: &str, ctx: &CommandContext, params: Value) -> Result<Value, CommandError> {
        let handler_exists = {
            let commands = self.commands.read();
            match commands.get(command) {
                Some(cmd) if cmd.admin_only && !ctx.identity.as_ref().is_some_and(|i| i.admin) => {
                    return Err(CommandError::Forbidden("admin login required".into()));
                }
                Some(_) => true,
                None => false,
            }
        };
        if !handler_exists {
            return Err(CommandError::NotFound);
        }
        let commands = self.commands.read();
        (commands[command].handler)(ctx, params)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CommandError> {
    serde_json::from_value(params).map_err(|err| CommandError::BadRequest(err.to_string()))
}

#[derive(Deserialize)]
struct LoginParams {
    user: String,
    password: String,
}

fn token_from_request(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let cookie_header = headers.get("cookie")?.to_str().ok()?;
    cookie_header.split(';').map(str::trim).find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == TOKEN_COOKIE_NAME).then(|| v.to_string())
    })
}

#[derive(Deserialize)]
struct CommandQuery {
    token: Option<String>,
}

async fn handle_command(
    State(commander): State<Arc<Commander>>,
    axum::extract::Path(command): axum::extract::Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<CommandQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let client_ip = peer.ip();
    if !commander.check_access_list(client_ip) {
        return (StatusCode::FORBIDDEN, "client ip not permitted").into_response();
    }

    let params: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Object(Default::default()))
    };

    match command.as_str() {
        "login" => {
            let Ok(login) = parse_params::<LoginParams>(params) else {
                return (StatusCode::BAD_REQUEST, "invalid login params").into_response();
            };
            login_response(&commander, client_ip, login, false)
        }
        "login_admin" => {
            let Ok(login) = parse_params::<LoginParams>(params) else {
                return (StatusCode::BAD_REQUEST, "invalid login params").into_response();
            };
            login_response(&commander, client_ip, login, true)
        }
        "logout" => {
            let token = token_from_request(&headers, query.token.as_deref());
            if let Some(token) = token {
                commander.remove_token(&token);
            }
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        _ => {
            let token = token_from_request(&headers, query.token.as_deref());
            let identity = match commander.is_valid_request(&command, token.as_deref(), client_ip) {
                Some(identity) => identity,
                None => return (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
            };
            let ctx = CommandContext { client_ip, identity };
            match commander.dispatch(&command, &ctx, params) {
                Ok(value) => Json(value).into_response(),
                Err(CommandError::NotFound) => (StatusCode::NOT_FOUND, "unknown command").into_response(),
                Err(CommandError::Forbidden(msg)) => (StatusCode::FORBIDDEN, msg).into_response(),
                Err(CommandError::BadRequest(msg)) => (StatusCode::BAD_REQUEST, msg).into_response(),
            }
        }
    }
}

fn login_response(commander: &Commander, client_ip: IpAddr, login: LoginParams, admin: bool) -> Response {
    match commander.handle_login(client_ip, login.user, login.password, admin) {
        Ok(value) => {
            let token = value["token"].as_str().unwrap_or("").to_string();
            let mut response = Json(value).into_response();
            if let Ok(cookie) = format!("{TOKEN_COOKIE_NAME}={token}; Path=/; HttpOnly").parse() {
                response.headers_mut().append("set-cookie", cookie);
            }
            response
        }
        Err(CommandError::Forbidden(msg)) => (StatusCode::UNAUTHORIZED, msg).into_response(),
        Err(other) => (StatusCode::BAD_REQUEST, other.to_string()).into_response(),
    }
}

/// Build the axum app for this commander; `main.rs` binds it (optionally on
/// a separate listener from the data-plane CSTP server, matching the
/// reference implementation's `EnableSeprateManagemnet` split).
pub fn router(commander: Arc<Commander>) -> Router {
    Router::new()
        .route("/api/:command", post(handle_command))
        .layer(TraceLayer::new_for_http())
        .with_state(commander)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_commander() -> Arc<Commander> {
        let config = CommanderConfig {
            bind_address: "127.0.0.1:0".into(),
            valid_clients: vec![],
            maintenance_hook: false,
            token_max_life_time: 3600,
            login_fail_track_time: 60,
            login_fail_count: 3,
        };
        Commander::new(config, Arc::new(AuthenticationManager::new()))
    }

    #[test]
    fn help_is_registered_by_default() {
        let commander = test_commander();
        let ctx = CommandContext { client_ip: "127.0.0.1".parse().unwrap(), identity: None };
        let result = commander.dispatch("help", &ctx, Value::Null).unwrap();
        assert!(result.as_array().unwrap().iter().any(|v| v["name"] == "help"));
    }

    #[test]
    #[should_panic(expected = "duplicate command registration")]
    fn duplicate_registration_panics() {
        let commander = test_commander();
        commander.register("help", "dup", false, |_, _| Ok(Value::Null));
    }

    #[test]
    fn token_round_trips_and_matches_issuing_ip() {
        let commander = test_commander();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let token = commander.create_token("alice", ip, false);
        let identity = commander.check_token(&token, ip).unwrap();
        assert_eq!(identity.username, "alice");
        assert!(!identity.admin);
    }

    #[test]
    fn token_rejected_from_a_different_ip() {
        let commander = test_commander();
        let token = commander.create_token("alice", "10.0.0.5".parse().unwrap(), false);
        assert!(commander.check_token(&token, "10.0.0.6".parse().unwrap()).is_none());
    }

    #[test]
    fn no_login_commands_bypass_token_check() {
        let commander = test_commander();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(commander.is_valid_request("login", None, ip).is_some());
        assert!(commander.is_valid_request("flows_list", None, ip).is_none());
    }

    #[test]
    fn access_list_rejects_unlisted_clients() {
        let config = CommanderConfig {
            bind_address: "127.0.0.1:0".into(),
            valid_clients: vec!["10.0.0.1".parse().unwrap()],
            maintenance_hook: false,
            token_max_life_time: 3600,
            login_fail_track_time: 60,
            login_fail_count: 3,
        };
        let commander = Commander::new(config, Arc::new(AuthenticationManager::new()));
        assert!(commander.check_access_list("10.0.0.1".parse().unwrap()));
        assert!(!commander.check_access_list("10.0.0.2".parse().unwrap()));
    }
}
