//! Local HTTP listener for browser-mediated login
//!
//! Binds the first free port of a range on the loopback interface and waits
//! for the browser to come back with either a refresh token or a guest
//! choice.
//!
//! | route                                     | effect                          |
//! |-------------------------------------------|---------------------------------|
//! | `/auth`                                   | info page with login links      |
//! | `/callback?refreshToken=..`               | reply with the refresh token    |
//! | `/guest`, `/auth/guest`, `/callback/guest`| reply as guest                  |
//! | `/exit`                                   | abort without a reply           |
//! | anything else                             | 404                             |
//!
//! Once a reply (or exit) has been received every route answers
//! "Already finished".

use crate::{Error, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What the browser sent back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    /// User chose guest access
    Guest,
    /// User logged in; refresh token to persist
    RefreshToken(String),
}

struct ServerState {
    port: u16,
    login_page: Option<String>,
    finished: AtomicBool,
    replies: mpsc::Sender<Option<LoginReply>>,
}

impl ServerState {
    /// First reply wins
    fn finish(&self, reply: Option<LoginReply>) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.replies.try_send(reply);
        true
    }

    fn callback_url(&self) -> String {
        format!("http://localhost:{}/callback", self.port)
    }
}

/// Running callback listener
pub struct AuthServer {
    port: u16,
    runtime: tokio::runtime::Runtime,
    replies: mpsc::Receiver<Option<LoginReply>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AuthServer {
    /// Bind the first free port in `port_start..=port_end` and start serving
    pub fn start(port_start: u16, port_end: u16, login_page: Option<String>) -> Result<Self> {
        let listener = (port_start..=port_end)
            .find_map(|port| StdTcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).ok())
            .ok_or_else(|| {
                Error::no_credentials(format!(
                    "No free port for the login listener in {}..={}",
                    port_start, port_end
                ))
            })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tessera-auth")
            .enable_all()
            .build()?;

        let (reply_tx, replies) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = Arc::new(ServerState {
            port,
            login_page,
            finished: AtomicBool::new(false),
            replies: reply_tx,
        });

        let app = Router::new()
            .route("/auth", get(auth_page))
            .route("/auth/guest", get(guest))
            .route("/callback/guest", get(guest))
            .route("/guest", get(guest))
            .route("/callback", get(callback))
            .route("/exit", get(exit))
            .fallback(not_found)
            .with_state(state);

        let listener = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(listener)?
        };
        runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::warn!("Login listener stopped with error: {}", e);
            }
        });

        tracing::debug!("Login listener on port {}", port);
        Ok(Self {
            port,
            runtime,
            replies,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Bound port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// URL to open in the browser
    pub fn auth_url(&self) -> String {
        format!("http://localhost:{}/auth", self.port)
    }

    /// Wait for a reply. `None` on timeout or `/exit`.
    pub fn wait_with_timeout(mut self, timeout: Duration) -> Result<Option<LoginReply>> {
        let replies = &mut self.replies;
        let reply = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, replies.recv()).await });
        self.stop();
        Ok(reply.ok().flatten().flatten())
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for AuthServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn auth_page(State(state): State<Arc<ServerState>>) -> Response {
    if state.finished.load(Ordering::SeqCst) {
        return already_finished();
    }
    let login_link = match &state.login_page {
        Some(page) => format!(
            "<p><a href=\"{}?redirectUrl={}\">Log in</a></p>",
            page,
            state.callback_url()
        ),
        None => "<p>No login page is configured for this upstream.</p>".to_string(),
    };
    Html(format!(
        "<html><body><h1>Tessera login</h1>{}<p><a href=\"/guest\">Continue as guest</a></p></body></html>",
        login_link
    ))
    .into_response()
}

async fn guest(State(state): State<Arc<ServerState>>) -> Response {
    if !state.finish(Some(LoginReply::Guest)) {
        return already_finished();
    }
    match &state.login_page {
        Some(page) => (
            StatusCode::FOUND,
            [(header::LOCATION, format!("{}/success", page.trim_end_matches('/')))],
        )
            .into_response(),
        None => Html("<html><body>Logged in as guest. You can close this window.</body></html>")
            .into_response(),
    }
}

async fn callback(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.finished.load(Ordering::SeqCst) {
        return already_finished();
    }
    let Some(token) = params.get("refreshToken").filter(|t| !t.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing refreshToken").into_response();
    };
    if !state.finish(Some(LoginReply::RefreshToken(token.clone()))) {
        return already_finished();
    }
    Html("<html><body>Login successful. You can close this window.</body></html>").into_response()
}

async fn exit(State(state): State<Arc<ServerState>>) -> Response {
    if !state.finish(None) {
        return already_finished();
    }
    "Stopping".into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

fn already_finished() -> Response {
    "Already finished".into_response()
}

/// Ask the desktop to open `url`; failures are logged
pub fn open_browser(url: &str) {
    let mut command = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else {
        std::process::Command::new("xdg-open")
    };
    if let Err(e) = command.arg(url).spawn() {
        tracing::warn!("Could not open a browser ({}). Visit {} to log in", e, url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn get_text(url: &str) -> (u16, String) {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        let resp = client.get(url).send().unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().unwrap())
    }

    #[test]
    fn test_callback_delivers_refresh_token() {
        let server = AuthServer::start(0, 0, None).unwrap();
        let port = server.port();

        let browser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let (status, _) = get_text(&format!("http://127.0.0.1:{}/nope", port));
            assert_eq!(status, 404);
            let (status, body) = get_text(&format!("http://127.0.0.1:{}/auth", port));
            assert_eq!(status, 200);
            assert!(body.contains("guest"));
            let (status, _) =
                get_text(&format!("http://127.0.0.1:{}/callback?refreshToken=abc", port));
            assert_eq!(status, 200);
        });

        let reply = server.wait_with_timeout(Duration::from_secs(10)).unwrap();
        browser.join().unwrap();
        assert_eq!(reply, Some(LoginReply::RefreshToken("abc".into())));
    }

    #[test]
    fn test_guest_redirects_to_login_page() {
        let server = AuthServer::start(0, 0, Some("https://login.example.org".into())).unwrap();
        let port = server.port();

        let browser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let (status, _) = get_text(&format!("http://127.0.0.1:{}/auth/guest", port));
            assert_eq!(status, 302);
        });

        let reply = server.wait_with_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(reply, Some(LoginReply::Guest));
        browser.join().unwrap();
    }

    #[test]
    fn test_skips_ports_in_use() {
        let first = AuthServer::start(0, 0, None).unwrap();
        assert_ne!(first.port(), 0);
        let busy = first.port();
        assert!(AuthServer::start(busy, busy, None).is_err());
    }

    #[test]
    fn test_first_reply_wins() {
        let (replies, mut rx) = mpsc::channel(1);
        let state = ServerState {
            port: 1,
            login_page: None,
            finished: AtomicBool::new(false),
            replies,
        };
        assert!(state.finish(Some(LoginReply::Guest)));
        assert!(!state.finish(Some(LoginReply::RefreshToken("late".into()))));
        assert_eq!(rx.try_recv().unwrap(), Some(LoginReply::Guest));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.callback_url(), "http://localhost:1/callback");
    }

    #[test]
    fn test_timeout_and_exit_yield_none() {
        let server = AuthServer::start(0, 0, None).unwrap();
        assert_eq!(server.wait_with_timeout(Duration::from_millis(50)).unwrap(), None);

        let server = AuthServer::start(0, 0, None).unwrap();
        let port = server.port();
        let browser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            get_text(&format!("http://127.0.0.1:{}/exit", port));
        });
        assert_eq!(server.wait_with_timeout(Duration::from_secs(10)).unwrap(), None);
        browser.join().unwrap();
    }
}
