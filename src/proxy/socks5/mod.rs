//! SOCKS5 proxy server and client.
//!
//! The server accepts CONNECT requests (plain or user/password
//! authenticated) and emits [`ProxyRequest`] values whose reply packet is
//! deferred until `success` or `fail`. The client turns a target address
//! into an open tunnel through a remote SOCKS5 server.
//!
//! Both sides speak an additional "simplified" dialect that skips the
//! hello/select phase entirely. It is only usable between instances of
//! this software and is incompatible with authentication.

pub mod packet;

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::addr::{Address, PeerIdentifier};
use crate::config::ProxyConfig;
use crate::error::{Error, ProxyError, ProxyErrorKind, ProxyResult, Result};
use crate::proxy::{CheckUser, ProxyClient, ProxyRequest, ProxyServer, RequestIds};
use crate::transport::{build_transport, BoxConn, Transport};

use packet::{
    Hello, ReqResp, Select, UserPassReq, UserPassResp, CMD_CONNECT, METHOD_NO_ACCEPTABLE,
    METHOD_NO_AUTH, METHOD_USER_PASS, REPLY_SUCCESS,
};

fn zero_addr() -> Address {
    Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
}

/// A downstream SOCKS5 proxy server.
pub struct Socks5Server {
    name: String,
    transport: Arc<dyn Transport>,
    addr: String,
    simplified: bool,
    check_user: Option<CheckUser>,
    ids: Arc<RequestIds>,
    token: CancellationToken,
}

impl Socks5Server {
    /// Build a server from configuration. `check_user` must be provided
    /// when the configuration enables `check_users`.
    pub fn new(
        name: &str,
        config: &ProxyConfig,
        ids: Arc<RequestIds>,
        check_user: Option<CheckUser>,
    ) -> Result<Self> {
        let addr = config
            .address
            .as_deref()
            .ok_or_else(|| Error::config("a valid 'address' must be specified for socks5"))?;
        let check_user = if config.check_users {
            Some(check_user.ok_or_else(|| {
                Error::config("'check_users' is enabled but no user backend is wired")
            })?)
        } else {
            None
        };
        if config.simplified && check_user.is_some() {
            return Err(Error::config(
                "simplified SOCKS5 does not support authentication",
            ));
        }

        Ok(Socks5Server {
            name: name.to_string(),
            transport: build_transport(config.transport.as_ref())?,
            addr: addr.to_string(),
            simplified: config.simplified,
            check_user,
            ids,
            token: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl ProxyServer for Socks5Server {
    async fn start(&mut self) -> Result<mpsc::Receiver<Box<dyn ProxyRequest>>> {
        let mut listener = match self.transport.listen(&self.addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!("failed to start SOCKS5 server on {}: {}", self.addr, e);
                return Err(e);
            }
        };
        tracing::info!(
            "SOCKS5 server '{}' started on {} (simplified: {})",
            self.name,
            self.addr,
            self.simplified
        );

        let (tx, rx) = mpsc::channel::<Box<dyn ProxyRequest>>(1);
        let token = self.token.clone();
        let name = self.name.clone();
        let simplified = self.simplified;
        let check_user = self.check_user.clone();
        let ids = Arc::clone(&self.ids);

        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            if !token.is_cancelled() {
                                tracing::warn!("accept error on '{}': {}", name, e);
                            }
                            break;
                        }
                    },
                };
                let req_id = ids.next_id();
                tracing::debug!(
                    "[{}] client connection accepted from {}",
                    req_id,
                    conn.peer_addr_text()
                );
                let tx = tx.clone();
                let check_user = check_user.clone();
                tokio::spawn(handshake(conn, req_id, simplified, check_user, tx));
            }
            tracing::info!("SOCKS5 server '{}' exited", name);
        });

        Ok(rx)
    }

    fn stop(&mut self) {
        tracing::info!("stopping SOCKS5 server '{}'", self.name);
        self.token.cancel();
    }
}

async fn handshake(
    mut conn: BoxConn,
    req_id: String,
    simplified: bool,
    check_user: Option<CheckUser>,
    tx: mpsc::Sender<Box<dyn ProxyRequest>>,
) {
    let mut user = None;

    if !simplified {
        let hello = match Hello::read(&mut conn).await {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!("[{}] bad hello: {}", req_id, e);
                return;
            }
        };

        if let Some(check) = &check_user {
            if !hello.methods.contains(&METHOD_USER_PASS) {
                tracing::debug!("[{}] client doesn't offer user/pass auth", req_id);
                let _ = Select {
                    method: METHOD_NO_ACCEPTABLE,
                }
                .write(&mut conn)
                .await;
                return;
            }
            match authenticate_client(&mut conn, check).await {
                Ok(name) => user = Some(name),
                Err(e) => {
                    tracing::warn!("[{}] user authentication failed: {}", req_id, e);
                    return;
                }
            }
        } else {
            if !hello.methods.contains(&METHOD_NO_AUTH) {
                tracing::debug!("[{}] client doesn't support no-auth", req_id);
                let _ = Select {
                    method: METHOD_NO_ACCEPTABLE,
                }
                .write(&mut conn)
                .await;
                return;
            }
            if let Err(e) = (Select {
                method: METHOD_NO_AUTH,
            })
            .write(&mut conn)
            .await
            {
                tracing::debug!("[{}] failed to write method selection: {}", req_id, e);
                return;
            }
        }
    }

    let request = match ReqResp::read(&mut conn).await {
        Ok(r) => r,
        Err(e) => {
            if e.is_addr_error() {
                let _ = ReqResp {
                    kind: ProxyErrorKind::AddrUnsupported as u8,
                    addr: zero_addr(),
                }
                .write(&mut conn)
                .await;
            }
            tracing::debug!("[{}] bad request: {}", req_id, e);
            return;
        }
    };

    if request.kind != CMD_CONNECT {
        tracing::debug!("[{}] client sent unsupported cmd: {}", req_id, request.kind);
        let _ = ReqResp {
            kind: ProxyErrorKind::CmdUnsupported as u8,
            addr: request.addr,
        }
        .write(&mut conn)
        .await;
        return;
    }

    let request = Socks5Request {
        id: req_id,
        conn,
        user,
        target: request.addr,
    };
    tracing::debug!(
        "[{}] handshake with SOCKS5 client succeeded, target {}",
        request.id,
        request.target
    );
    // the dispatcher owns the request from here; if it is gone the
    // connection just drops
    let _ = tx.send(Box::new(request)).await;
}

async fn authenticate_client(conn: &mut BoxConn, check: &CheckUser) -> Result<String> {
    Select {
        method: METHOD_USER_PASS,
    }
    .write(conn)
    .await?;
    let auth = UserPassReq::read(conn).await?;
    if !check(&auth.username, &auth.password) {
        let _ = UserPassResp { success: false }.write(conn).await;
        return Err(Error::Auth(format!("user '{}' rejected", auth.username)));
    }
    UserPassResp { success: true }.write(conn).await?;
    Ok(auth.username)
}

struct Socks5Request {
    id: String,
    conn: BoxConn,
    user: Option<String>,
    target: Address,
}

#[async_trait]
impl ProxyRequest for Socks5Request {
    fn target_addr(&self) -> &Address {
        &self.target
    }

    fn peer_addr(&self) -> String {
        self.conn.peer_addr_text()
    }

    fn peer_identifiers(&self) -> Result<Vec<PeerIdentifier>> {
        let mut ids = Vec::new();
        if let Some(user) = &self.user {
            ids.push(PeerIdentifier::new(PeerIdentifier::SCOPE_SOCKS5, user));
        }
        ids.extend(self.conn.peer_identifiers()?);
        Ok(ids)
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn success(self: Box<Self>, bound: Address) -> BoxConn {
        let mut conn = self.conn;
        if let Err(e) = (ReqResp {
            kind: REPLY_SUCCESS,
            addr: bound,
        })
        .write(&mut conn)
        .await
        {
            // a truly broken stream will surface on the first relayed byte
            tracing::warn!("[{}] failed to write response packet: {}", self.id, e);
        }
        conn
    }

    async fn fail(self: Box<Self>, kind: ProxyErrorKind) {
        let mut conn = self.conn;
        if let Err(e) = (ReqResp {
            kind: kind as u8,
            addr: zero_addr(),
        })
        .write(&mut conn)
        .await
        {
            tracing::warn!("[{}] failed to write error response: {}", self.id, e);
        }
        if let Err(e) = conn.shutdown().await {
            tracing::debug!("[{}] error closing client connection: {}", self.id, e);
        }
    }
}

/// An upstream SOCKS5 proxy client.
pub struct Socks5Client {
    transport: Arc<dyn Transport>,
    addr: String,
    simplified: bool,
    username: Option<String>,
    password: Option<String>,
}

impl Socks5Client {
    /// Build a client from configuration.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let addr = config
            .address
            .as_deref()
            .ok_or_else(|| Error::config("a valid 'address' must be specified for socks5"))?;
        if config.simplified && (config.username.is_some() || config.password.is_some()) {
            return Err(Error::config(
                "simplified SOCKS5 does not support authentication",
            ));
        }
        Ok(Socks5Client {
            transport: build_transport(config.transport.as_ref())?,
            addr: addr.to_string(),
            simplified: config.simplified,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn authenticate(&self, conn: &mut BoxConn) -> ProxyResult<()> {
        let mut methods = vec![METHOD_NO_AUTH];
        if self.username.is_some() && self.password.is_some() {
            methods.push(METHOD_USER_PASS);
        }
        let general = ProxyError::general;

        Hello { methods }
            .write(conn)
            .await
            .map_err(general)?;
        let selected = Select::read(conn).await.map_err(general)?;

        match selected.method {
            METHOD_NO_AUTH => Ok(()),
            METHOD_USER_PASS => {
                let (username, password) =
                    match (self.username.as_ref(), self.password.as_ref()) {
                        (Some(u), Some(p)) => (u.clone(), p.clone()),
                        _ => {
                            return Err(general(Error::Auth(
                                "server requires credentials we don't have".into(),
                            )));
                        }
                    };
                UserPassReq { username, password }
                    .write(conn)
                    .await
                    .map_err(general)?;
                let resp = UserPassResp::read(conn).await.map_err(general)?;
                if !resp.success {
                    return Err(general(Error::Auth(
                        "authentication to SOCKS server failed".into(),
                    )));
                }
                Ok(())
            }
            other => Err(general(Error::protocol(format!(
                "SOCKS server requires unknown authentication: {other}"
            )))),
        }
    }
}

#[async_trait]
impl ProxyClient for Socks5Client {
    async fn request(&self, addr: &Address) -> ProxyResult<(BoxConn, Address)> {
        let mut conn = self
            .transport
            .dial(&self.addr)
            .await
            .map_err(ProxyError::general)?;

        if !self.simplified {
            self.authenticate(&mut conn).await?;
        }

        ReqResp {
            kind: CMD_CONNECT,
            addr: addr.clone(),
        }
        .write(&mut conn)
        .await
        .map_err(|e| {
            if e.is_addr_error() {
                ProxyError::new(ProxyErrorKind::AddrUnsupported, e)
            } else {
                ProxyError::general(e)
            }
        })?;

        let reply = ReqResp::read(&mut conn).await.map_err(ProxyError::general)?;
        if reply.kind != REPLY_SUCCESS {
            let kind = ProxyErrorKind::from_reply(reply.kind);
            return Err(ProxyError::new(
                kind,
                Error::protocol(format!("SOCKS server replies: {kind}")),
            ));
        }

        Ok((conn, reply.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server_config(addr: &str, simplified: bool, check_users: bool) -> ProxyConfig {
        ProxyConfig {
            protocol: "socks5".into(),
            address: Some(addr.into()),
            simplified,
            check_users,
            ..Default::default()
        }
    }

    fn client_config(
        addr: &str,
        simplified: bool,
        creds: Option<(&str, &str)>,
    ) -> ProxyConfig {
        ProxyConfig {
            protocol: "socks5".into(),
            address: Some(addr.into()),
            simplified,
            username: creds.map(|(u, _)| u.to_string()),
            password: creds.map(|(_, p)| p.to_string()),
            ..Default::default()
        }
    }

    // the request channel does not expose the listener, so tests bind
    // explicit ports in a private range, one per test
    async fn spawn_server(
        addr: &str,
        simplified: bool,
        check_user: Option<CheckUser>,
    ) -> (Socks5Server, mpsc::Receiver<Box<dyn ProxyRequest>>) {
        let config = server_config(addr, simplified, check_user.is_some());
        let mut server =
            Socks5Server::new("test", &config, Arc::new(RequestIds::new()), check_user)
                .unwrap();
        let rx = server.start().await.unwrap();
        (server, rx)
    }

    #[tokio::test]
    async fn test_connect_roundtrip() {
        let addr = "127.0.0.1:42811";
        let (mut server, mut rx) = spawn_server(addr, false, None).await;

        let client = Socks5Client::new(&client_config(addr, false, None)).unwrap();
        let target = Address::Domain("echo.example".into(), 7);

        let client_task = tokio::spawn(async move {
            let (mut conn, bound) = client.request(&target).await.unwrap();
            assert_eq!(bound, Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 7));
            conn.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        });

        let req = rx.recv().await.unwrap();
        assert_eq!(
            req.target_addr(),
            &Address::Domain("echo.example".into(), 7)
        );
        assert!(req.peer_identifiers().unwrap().is_empty());

        let mut conn = req
            .success(Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 7))
            .await;
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").await.unwrap();

        client_task.await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_simplified_dialect() {
        let addr = "127.0.0.1:42812";
        let (mut server, mut rx) = spawn_server(addr, true, None).await;

        let client = Socks5Client::new(&client_config(addr, true, None)).unwrap();
        let target = Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1), 443);

        let client_task = tokio::spawn(async move {
            client.request(&target).await.unwrap();
        });

        let req = rx.recv().await.unwrap();
        assert_eq!(
            req.target_addr(),
            &Address::Ipv4(Ipv4Addr::new(192, 0, 2, 1), 443)
        );
        let _conn = req.success(zero_addr()).await;
        client_task.await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_auth_success_attaches_identifier() {
        let addr = "127.0.0.1:42813";
        let check: CheckUser = Arc::new(|user, pass| user == "alice" && pass == "secret");
        let (mut server, mut rx) = spawn_server(addr, false, Some(check)).await;

        let client =
            Socks5Client::new(&client_config(addr, false, Some(("alice", "secret"))))
                .unwrap();
        let target = Address::Domain("t".into(), 1);
        let client_task = tokio::spawn(async move {
            client.request(&target).await.unwrap();
        });

        let req = rx.recv().await.unwrap();
        let ids = req.peer_identifiers().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].scope, PeerIdentifier::SCOPE_SOCKS5);
        assert_eq!(ids[0].unique_id, "alice");
        let _conn = req.success(zero_addr()).await;
        client_task.await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let addr = "127.0.0.1:42814";
        let check: CheckUser = Arc::new(|user, pass| user == "alice" && pass == "secret");
        let (mut server, _rx) = spawn_server(addr, false, Some(check)).await;

        let client =
            Socks5Client::new(&client_config(addr, false, Some(("alice", "wrong"))))
                .unwrap();
        let err = client
            .request(&Address::Domain("t".into(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProxyErrorKind::GeneralErr);
        server.stop();
    }

    #[tokio::test]
    async fn test_fail_reaches_client_with_kind() {
        let addr = "127.0.0.1:42815";
        let (mut server, mut rx) = spawn_server(addr, false, None).await;

        let client = Socks5Client::new(&client_config(addr, false, None)).unwrap();
        let client_task = tokio::spawn(async move {
            client
                .request(&Address::Domain("blocked".into(), 80))
                .await
                .unwrap_err()
        });

        let req = rx.recv().await.unwrap();
        req.fail(ProxyErrorKind::NotAllowed).await;

        let err = client_task.await.unwrap();
        assert_eq!(err.kind, ProxyErrorKind::NotAllowed);
        server.stop();
    }

    #[tokio::test]
    async fn test_non_connect_command_refused() {
        let addr = "127.0.0.1:42816";
        let (mut server, _rx) = spawn_server(addr, false, None).await;

        let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
        raw.write_all(&[0x05, 0x01, 0x00]).await.unwrap(); // hello, no-auth
        let mut sel = [0u8; 2];
        raw.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);

        // BIND request
        raw.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        raw.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ProxyErrorKind::CmdUnsupported as u8);
        server.stop();
    }

    #[test]
    fn test_simplified_plus_auth_rejected() {
        let check: CheckUser = Arc::new(|_, _| true);
        let config = server_config("127.0.0.1:0", true, true);
        assert!(Socks5Server::new(
            "test",
            &config,
            Arc::new(RequestIds::new()),
            Some(check)
        )
        .is_err());

        let config = client_config("127.0.0.1:1080", true, Some(("u", "p")));
        assert!(Socks5Client::new(&config).is_err());
    }
}
