//! Application server lifecycle.
//!
//! `AppProcess` owns the application subprocess for one session: it leases
//! a port, spawns the launch command with output captured into the
//! session's [`LogStore`], polls the root URL until it answers, and tears
//! the process down (politely, then forcefully) when stopped or dropped.

use crate::config::ResolvedConfig;
use crate::error::{Component, DriverError, Result};
use crate::log::{LogEntry, LogLevel, LogSource, LogStore};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::sleep;

/// Interval between health probes while the application starts.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-request timeout for health probes.
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a terminated process gets before it is killed.
const GRACEFUL_STOP: Duration = Duration::from_secs(1);

/// Server log lines attached to launch and process-death errors.
const LOG_TAIL: usize = 50;

/// Ports held by live sessions in this process.
static LEASED_PORTS: Lazy<Mutex<HashSet<u16>>> = Lazy::new(Mutex::default);

/// Exclusive claim on a TCP port for the lifetime of a session.
///
/// Released when dropped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    /// Leases `requested`, or an ephemeral port when `None`.
    ///
    /// # Errors
    ///
    /// `PortInUse` if a requested port is leased by another session or
    /// cannot be bound.
    pub fn acquire(host: &str, requested: Option<u16>) -> Result<Self> {
        let mut leased = LEASED_PORTS.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(port) = requested {
            if leased.contains(&port) || TcpListener::bind((host, port)).is_err() {
                return Err(DriverError::PortInUse(port));
            }
            leased.insert(port);
            return Ok(Self { port });
        }

        // The OS hands out ports round-robin, so a handful of attempts is
        // enough to step past any we already hold.
        for _ in 0..16 {
            let port = TcpListener::bind((host, 0))?.local_addr()?.port();
            if leased.insert(port) {
                return Ok(Self { port });
            }
        }
        Err(DriverError::LaunchFailed {
            reason: format!("no free port available on {host}"),
            source: None,
        })
    }

    /// The leased port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        LEASED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

/// A running application server.
#[derive(Debug)]
pub struct AppProcess {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    url: String,
    logs: LogStore,
    lease: PortLease,
}

impl AppProcess {
    /// Spawns the application and waits until its root URL responds.
    ///
    /// # Errors
    ///
    /// - `PortInUse` for an unavailable fixed port
    /// - `LaunchFailed` if the command cannot be spawned or exits early
    /// - `LaunchTimeout` if the URL stays unreachable for `load_timeout`
    pub async fn start(config: &ResolvedConfig, logs: LogStore) -> Result<Self> {
        let lease = PortLease::acquire(&config.host, config.port)?;
        let port = lease.port();
        let (program, args) = config.launch_command(port);

        tracing::info!(%program, port, app_dir = %config.app_dir.display(), "starting application");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&config.app_dir)
            .env("APP_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(seed) = config.seed {
            cmd.env("APP_SEED", seed.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| DriverError::LaunchFailed {
            reason: format!("could not run '{program}'"),
            source: Some(Box::new(e)),
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, logs.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, logs.clone(), true));
        }

        let process = Self {
            pid: child.id(),
            child: Mutex::new(Some(child)),
            url: format!("http://{}:{port}/", connect_host(&config.host)),
            logs,
            lease,
        };

        if let Err(e) = process.wait_until_healthy(config.load_timeout).await {
            let _ = process.stop().await;
            return Err(e);
        }

        tracing::info!(url = %process.url, "application is serving");
        Ok(process)
    }

    async fn wait_until_healthy(&self, timeout: Duration) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()?;
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            if let Some(status) = self.exit_status()? {
                // Let the pumps drain what the process wrote before exiting.
                sleep(HEALTH_POLL_INTERVAL).await;
                return Err(DriverError::LaunchFailed {
                    reason: format!(
                        "application exited with {status} before serving requests\n\nServer logs:\n{}",
                        self.logs.tail(LogSource::Server, LOG_TAIL)
                    ),
                    source: None,
                });
            }

            match client.get(&self.url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => tracing::debug!(status = %resp.status(), "application not ready"),
                Err(e) if !e.is_connect() => tracing::debug!(error = %e, "health probe failed"),
                Err(_) => {
                    if attempts == 1 {
                        tracing::debug!("waiting for application to listen");
                    }
                }
            }

            if start.elapsed() >= timeout {
                return Err(DriverError::LaunchTimeout {
                    url: self.url.clone(),
                    timeout,
                    logs: self.logs.tail(LogSource::Server, LOG_TAIL),
                });
            }

            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// The application's root URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The leased port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// OS process id, if the process was started.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exit_status(&self) -> Result<Option<std::process::ExitStatus>> {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Fails with `ProcessDied` if the application has exited.
    ///
    /// # Errors
    ///
    /// `ProcessDied` carrying the exit status and recent server logs.
    pub fn check_alive(&self) -> Result<()> {
        match self.exit_status()? {
            None => Ok(()),
            Some(status) => Err(DriverError::ProcessDied {
                component: Component::Server,
                detail: format!(
                    "exited with {status}\n\nRecent server logs:\n{}",
                    self.logs.tail(LogSource::Server, LOG_TAIL)
                ),
            }),
        }
    }

    /// Stops the application. Safe to call repeatedly and on a dead process.
    ///
    /// Sends SIGTERM where available, then kills the process if it has not
    /// exited within a second.
    ///
    /// # Errors
    ///
    /// `Io` if the process could not be signalled or reaped.
    pub async fn stop(&self) -> Result<()> {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            return Ok(());
        }

        tracing::debug!(pid = ?self.pid, "stopping application");
        terminate(&child);

        match tokio::time::timeout(GRACEFUL_STOP, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                tracing::debug!(pid = ?self.pid, "application ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

impl Drop for AppProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// Wildcard bind addresses are not connectable; probe loopback instead.
fn connect_host(host: &str) -> &str {
    match host {
        "0.0.0.0" => "127.0.0.1",
        "::" => "[::1]",
        other => other,
    }
}

/// Copies one output stream into the log store, line by line.
async fn pump<R: AsyncRead + Unpin>(reader: R, logs: LogStore, stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let level = if stderr { classify(&line) } else { LogLevel::Info };
        logs.push(LogEntry::new(LogSource::Server, level, line));
    }
}

/// Many servers write routine output to stderr, so only lines that announce
/// themselves as problems are raised above info.
fn classify(line: &str) -> LogLevel {
    let trimmed = line.trim_start();
    if trimmed.starts_with("Error") || trimmed.starts_with("error") {
        LogLevel::Error
    } else if trimmed.starts_with("Warning") || trimmed.starts_with("warning") {
        LogLevel::Warning
    } else {
        LogLevel::Info
    }
}
