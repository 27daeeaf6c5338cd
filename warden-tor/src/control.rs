//! Tor control port session
//!
//! Speaks the line-based control protocol over TCP. A session must
//! authenticate before anything else is accepted, is bound to a single
//! daemon run through its [`Liveness`] token, and is poisoned by the first
//! I/O failure: callers reconnect instead of reusing a broken channel.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use warden_core::{
    Circuit, CircuitStatus, Liveness, RelayDescriptor, Result, WardenError, LOCALHOST,
};

/// Signals accepted by `SIGNAL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorSignal {
    /// Switch to clean circuits for new connections
    NewNym,
    /// Controlled shutdown
    Shutdown,
}

impl TorSignal {
    fn keyword(self) -> &'static str {
        match self {
            TorSignal::NewNym => "NEWNYM",
            TorSignal::Shutdown => "SHUTDOWN",
        }
    }
}

/// A complete reply: final status code plus every line's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> String {
        self.lines.join(" ")
    }

    fn into_result(self) -> Result<Reply> {
        match self.status {
            250 | 251 => Ok(self),
            515 => Err(WardenError::AuthenticationRejected(self.text())),
            514 => Err(WardenError::Unauthenticated),
            code => Err(WardenError::Protocol(format!("{} {}", code, self.text()))),
        }
    }
}

/// Authenticated connection to the daemon's control port
pub struct ControlSession {
    stream: BufReader<TcpStream>,
    authenticated: bool,
    broken: bool,
    liveness: Option<Liveness>,
    timeout: Duration,
}

impl ControlSession {
    /// Open a connection without authenticating
    pub async fn open(addr: &str, timeout: Duration) -> Result<Self> {
        debug!("Connecting to Tor control port: {}", addr);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(WardenError::Transport(format!(
                    "failed to connect to control port {}: {}",
                    addr, e
                )))
            },
            Err(_) => {
                return Err(WardenError::Transport(format!(
                    "timed out connecting to control port {}",
                    addr
                )))
            },
        };

        Ok(Self {
            stream: BufReader::new(stream),
            authenticated: false,
            broken: false,
            liveness: None,
            timeout,
        })
    }

    /// Open and authenticate against the local control port
    pub async fn connect(port: u16, secret: &str, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", LOCALHOST, port);
        let mut session = Self::open(&addr, timeout).await?;
        session.authenticate(secret).await?;
        Ok(session)
    }

    /// Tie this session to a daemon run; once the run ends every command fails
    pub fn bind(&mut self, liveness: Liveness) {
        self.liveness = Some(liveness);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Authenticated, unbroken, and its daemon run is still live
    pub fn is_usable(&self) -> bool {
        self.authenticated && !self.is_stale()
    }

    fn is_stale(&self) -> bool {
        self.broken || self.liveness.as_ref().is_some_and(|l| !l.is_alive())
    }

    /// Authenticate with the plaintext secret matching HashedControlPassword
    pub async fn authenticate(&mut self, secret: &str) -> Result<()> {
        if self.is_stale() {
            return Err(WardenError::SessionInvalid);
        }

        let cmd = format!("AUTHENTICATE {}\r\n", hex::encode(secret.as_bytes()));
        match self.exchange(&cmd).await {
            Ok(_) => {
                self.authenticated = true;
                debug!("Control session authenticated");
                Ok(())
            },
            Err(e) => {
                self.authenticated = false;
                if let WardenError::AuthenticationRejected(_) = e {
                    warn!("Tor rejected the control secret");
                }
                Err(e)
            },
        }
    }

    /// Send a signal to the daemon
    pub async fn signal(&mut self, signal: TorSignal) -> Result<()> {
        info!("Sending SIGNAL {}", signal.keyword());
        self.command(&format!("SIGNAL {}\r\n", signal.keyword()))
            .await?;
        Ok(())
    }

    /// Request fresh circuits for new connections
    pub async fn new_identity(&mut self) -> Result<()> {
        self.signal(TorSignal::NewNym).await
    }

    /// Get information about the Tor daemon
    pub async fn get_info(&mut self, keyword: &str) -> Result<String> {
        let reply = self.command(&format!("GETINFO {}\r\n", keyword)).await?;
        let prefix = format!("{}=", keyword);

        let mut value = Vec::new();
        let mut in_value = false;
        for line in reply.lines {
            if let Some(rest) = line.strip_prefix(&prefix) {
                in_value = true;
                if !rest.is_empty() {
                    value.push(rest.to_string());
                }
            } else if in_value && line != "OK" {
                value.push(line);
            }
        }

        if !in_value {
            return Err(WardenError::Protocol(format!(
                "GETINFO reply is missing {}",
                keyword
            )));
        }
        Ok(value.join("\n"))
    }

    /// Circuits usable for routing right now. Only BUILT circuits are returned.
    pub async fn query_circuits(&mut self) -> Result<Vec<Circuit>> {
        let raw = self.get_info("circuit-status").await?;
        let circuits: Vec<Circuit> = parse_circuit_status(&raw)
            .into_iter()
            .filter(|c| c.status == CircuitStatus::Built)
            .collect();

        debug!("{} built circuits", circuits.len());
        Ok(circuits)
    }

    /// PID of the daemon on the other end
    pub async fn daemon_pid(&mut self) -> Result<u32> {
        let raw = self.get_info("process/pid").await?;
        raw.trim()
            .parse()
            .map_err(|_| WardenError::Protocol(format!("invalid process/pid: {:?}", raw)))
    }

    /// Bootstrap progress in percent
    pub async fn bootstrap_progress(&mut self) -> Result<u8> {
        let raw = self.get_info("status/bootstrap-phase").await?;
        raw.split_whitespace()
            .find_map(|token| token.strip_prefix("PROGRESS="))
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| WardenError::Protocol(format!("no PROGRESS in {:?}", raw)))
    }

    /// Close politely; errors are irrelevant at this point
    pub async fn close(mut self) {
        if !self.is_stale() {
            let _ = self.exchange("QUIT\r\n").await;
        }
    }

    /// Run a command that requires an authenticated, live session
    async fn command(&mut self, cmd: &str) -> Result<Reply> {
        if self.is_stale() {
            return Err(WardenError::SessionInvalid);
        }
        if !self.authenticated {
            return Err(WardenError::Unauthenticated);
        }
        self.exchange(cmd).await
    }

    /// Write one command and read its reply. Any transport failure or
    /// timeout poisons the session since the stream may be out of sync.
    async fn exchange(&mut self, cmd: &str) -> Result<Reply> {
        let verb = cmd.split_whitespace().next().unwrap_or("");
        debug!("Sending Tor command: {}", verb);

        let outcome = tokio::time::timeout(self.timeout, async {
            self.stream.get_mut().write_all(cmd.as_bytes()).await?;
            self.stream.get_mut().flush().await?;
            read_reply(&mut self.stream).await
        })
        .await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.poison();
                return Err(match e {
                    WardenError::Io(io) => WardenError::Transport(io.to_string()),
                    other => other,
                });
            },
            Err(_) => {
                self.poison();
                return Err(WardenError::Transport(format!(
                    "timed out waiting for reply to {}",
                    verb
                )));
            },
        };

        debug!("Tor replied {} to {}", reply.status, verb);
        reply.into_result()
    }

    fn poison(&mut self) {
        warn!("Control session broken; it must be re-established");
        self.broken = true;
        self.authenticated = false;
    }
}

/// Read lines until the end-of-reply line (`NNN ` separator).
/// Data blocks (`NNN+`) run until a lone `.`; asynchronous events (650) are skipped.
async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let line = read_line(reader).await?;
        if line.len() < 4 {
            return Err(WardenError::Protocol(format!("short reply line: {:?}", line)));
        }

        let status: u16 = line
            .get(..3)
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| WardenError::Protocol(format!("bad status in {:?}", line)))?;
        let separator = line.as_bytes()[3];
        let text = line.get(4..).unwrap_or_default().to_string();

        if status == 650 {
            if separator == b'+' {
                skip_data_block(reader).await?;
            }
            continue;
        }

        match separator {
            b' ' => {
                lines.push(text);
                return Ok(Reply { status, lines });
            },
            b'-' => lines.push(text),
            b'+' => {
                lines.push(text);
                loop {
                    let data = read_line(reader).await?;
                    if data == "." {
                        break;
                    }
                    let unstuffed = data.strip_prefix('.').unwrap_or(&data);
                    lines.push(unstuffed.to_string());
                }
            },
            _ => {
                return Err(WardenError::Protocol(format!(
                    "bad separator in {:?}",
                    line
                )))
            },
        }
    }
}

async fn skip_data_block<R>(reader: &mut R) -> Result<()>
where
    R: AsyncBufReadExt + Unpin,
{
    while read_line(reader).await? != "." {}
    Ok(())
}

async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(WardenError::Transport("control connection closed".into()));
    }
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}

/// Parse the body of `GETINFO circuit-status`, one circuit per line:
/// `<id> <STATUS> [<path>] [KEY=VALUE ...]`
pub fn parse_circuit_status(raw: &str) -> Vec<Circuit> {
    raw.lines().filter_map(parse_circuit_line).collect()
}

fn parse_circuit_line(line: &str) -> Option<Circuit> {
    let mut tokens = line.split_whitespace();
    let id = tokens.next()?.to_string();
    let status = CircuitStatus::from_keyword(tokens.next()?)?;

    let mut path = Vec::new();
    let mut purpose = None;
    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            // `$FP=nick` path entries also contain '=', keyword args never start with '$'
            if !key.starts_with('$') {
                if key == "PURPOSE" {
                    purpose = Some(value.to_string());
                }
                continue;
            }
        }
        if path.is_empty() && token.starts_with('$') {
            path = token.split(',').map(parse_relay).collect();
        }
    }

    Some(Circuit {
        id,
        status,
        path,
        purpose,
    })
}

/// `$FINGERPRINT~nickname`, `$FINGERPRINT=nickname` or `$FINGERPRINT`
fn parse_relay(entry: &str) -> RelayDescriptor {
    let entry = entry.trim_start_matches('$');
    let (fingerprint, nickname) = match entry.split_once(&['~', '='][..]) {
        Some((fp, nick)) => (fp, Some(nick.to_string())),
        None => (entry, None),
    };
    RelayDescriptor {
        fingerprint: fingerprint.to_string(),
        nickname,
        country: None,
    }
}
