use crate::channel::ResultSender;
use crate::signal::ShutdownSignal;
use goodput_lab_abstract::CongestionControl;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Upper bound on one readiness wait, so the drain loop re-checks the stop flag.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept a connection: {0}")]
    Accept(#[source] io::Error),
    #[error("shutdown was raised before any client connected")]
    NoConnection,
    #[error("connection error while draining: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Bytes drained per readiness event, and the unit of the message counter.
    pub packet_size: usize,
    /// Algorithm the client is expected to use; recorded in logs only.
    pub congestion_control: CongestionControl,
    pub recv_buffer_bytes: usize,
}

impl ServerConfig {
    pub fn new(port: u16, packet_size: usize, congestion_control: CongestionControl) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            packet_size,
            congestion_control,
            recv_buffer_bytes: 6_553_600,
        }
    }
}

/// `messages * size * 8 / elapsed / 1e6`, or zero when no time has passed.
pub fn goodput_mbps(messages: u64, packet_size: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (messages as f64 * packet_size as f64 * 8.0) / secs / 1e6
}

/// Counters collected while draining one connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub messages: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    pub packet_size: usize,
}

impl Measurement {
    pub fn goodput_mbps(&self) -> f64 {
        goodput_mbps(self.messages, self.packet_size, self.elapsed)
    }

    /// Rate derived from bytes actually read rather than from the message count.
    pub fn byte_goodput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs / 1e6
    }
}

/// Single-shot listener: accepts one client, drains it until told to stop.
pub struct GoodputServer {
    listener: TcpListener,
    config: ServerConfig,
}

impl GoodputServer {
    /// Binds with address reuse and listens with a backlog of one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let port = config.port;
        let addr = SocketAddr::new(config.bind_addr, port);
        let bind_err = |source| ServerError::Bind { port, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_bytes) {
            warn!(port, "could not set receive buffer to {}: {}", config.recv_buffer_bytes, e);
        }
        socket.bind(&addr.into()).map_err(bind_err)?;

        let listen_err = |source| ServerError::Listen { port, source };
        socket.listen(1).map_err(listen_err)?;
        socket.set_nonblocking(true).map_err(listen_err)?;
        let listener =
            TcpListener::from_std(std::net::TcpListener::from(socket)).map_err(listen_err)?;

        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts exactly one connection and drains it until `shutdown` is raised.
    pub async fn serve(self, shutdown: &ShutdownSignal) -> Result<Measurement, ServerError> {
        let cc = self.config.congestion_control;
        info!(port = self.config.port, %cc, "Server awaiting connection");

        let (stream, peer) = tokio::select! {
            accepted = self.listener.accept() => accepted.map_err(ServerError::Accept)?,
            _ = shutdown.raised() => {
                warn!(port = self.config.port, "Shutdown raised before a client connected");
                return Err(ServerError::NoConnection);
            }
        };
        info!(%peer, "Server accepted connection");

        let measurement = drain(stream, shutdown, self.config.packet_size).await?;
        // Dropping the listener closes the listening socket.
        drop(self.listener);

        debug!(
            messages = measurement.messages,
            bytes = measurement.bytes,
            size = measurement.packet_size,
            elapsed = ?measurement.elapsed,
            byte_goodput = measurement.byte_goodput_mbps(),
            "Server finished draining"
        );
        info!("Shutdown server");
        Ok(measurement)
    }

    /// Runs one full server lifecycle and publishes exactly one value on `result`.
    ///
    /// `listening` receives the bound address once the socket accepts
    /// connections; it is dropped unsent if binding fails.
    pub async fn run(
        result: ResultSender,
        shutdown: ShutdownSignal,
        listening: oneshot::Sender<SocketAddr>,
        config: ServerConfig,
    ) {
        let port = config.port;
        let outcome = match Self::bind(config) {
            Ok(server) => match server.local_addr() {
                Ok(addr) => {
                    let _ = listening.send(addr);
                    server.serve(&shutdown).await.map(|m| m.goodput_mbps())
                }
                Err(source) => {
                    error!("Could not read bound address: {}", source);
                    Err(ServerError::Listen { port, source })
                }
            },
            Err(e) => {
                error!("Binding error: {}", e);
                Err(e)
            }
        };

        if let Ok(goodput) = &outcome {
            info!("Estimated goodput: {:.3} Mbps", goodput);
        }
        if !result.publish(outcome) {
            warn!("Result receiver dropped before the server reported");
        }
    }
}

async fn drain(
    mut stream: TcpStream,
    shutdown: &ShutdownSignal,
    packet_size: usize,
) -> Result<Measurement, ServerError> {
    let mut buf = vec![0u8; packet_size];
    let mut messages: u64 = 0;
    let mut bytes: u64 = 0;
    let start = Instant::now();
    let mut last_heartbeat = start;
    // Set when the peer hangs up; the measurement window ends there.
    let mut closed_after: Option<Duration> = None;

    while !shutdown.is_raised() {
        if last_heartbeat.elapsed() > HEARTBEAT_INTERVAL {
            debug!(
                messages,
                bytes,
                shutdown = shutdown.is_raised(),
                "Server heartbeat"
            );
            last_heartbeat = Instant::now();
        }

        if closed_after.is_some() {
            let _ = tokio::time::timeout(POLL_TIMEOUT, shutdown.raised()).await;
            continue;
        }

        // `read` consumes the cooperative budget: the loop has to yield to the
        // runtime even while the peer never pauses.
        match tokio::time::timeout(POLL_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                info!(messages, bytes, "Client closed the connection");
                closed_after = Some(start.elapsed());
                continue;
            }
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) if is_disconnect(&e) => {
                info!(messages, bytes, "Client connection dropped: {}", e);
                closed_after = Some(start.elapsed());
                continue;
            }
            Ok(Err(e)) => return Err(ServerError::Io(e)),
            // Nothing arrived within the poll window.
            Err(_) => {}
        }
        messages += 1;
    }

    let elapsed = closed_after.unwrap_or_else(|| start.elapsed());
    if let Err(e) = stream.shutdown().await {
        debug!("connection shutdown: {}", e);
    }

    Ok(Measurement {
        messages,
        bytes,
        elapsed,
        packet_size,
    })
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::result_channel;
    use tokio::io::AsyncWriteExt;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            packet_size: 1024,
            congestion_control: CongestionControl::Cubic,
            recv_buffer_bytes: 1 << 20,
        }
    }

    #[test]
    fn goodput_formula() {
        // 1000 messages of 1250 bytes in one second = 10 Mbps
        let g = goodput_mbps(1000, 1250, Duration::from_secs(1));
        assert!((g - 10.0).abs() < 1e-9);
    }

    #[test]
    fn goodput_is_finite_and_non_negative() {
        for (messages, size, millis) in [(0, 1024, 1), (u32::MAX as u64, 65536, 3), (17, 1, 999_999)] {
            let g = goodput_mbps(messages, size, Duration::from_millis(millis));
            assert!(g.is_finite());
            assert!(g >= 0.0);
        }
        assert_eq!(goodput_mbps(10, 1024, Duration::ZERO), 0.0);
    }

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig {
            port,
            ..loopback_config()
        };
        let err = GoodputServer::bind(config).err().expect("port is in use");
        assert!(matches!(err, ServerError::Bind { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn run_reports_bind_failure_on_the_channel() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (tx, rx) = result_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let config = ServerConfig {
            port,
            ..loopback_config()
        };

        GoodputServer::run(tx, ShutdownSignal::new(), ready_tx, config).await;

        assert!(ready_rx.await.is_err(), "never reported listening");
        let result = rx.recv_timeout(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn shutdown_without_a_client_reports_no_connection() {
        let (tx, rx) = result_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(GoodputServer::run(
            tx,
            shutdown.clone(),
            ready_tx,
            loopback_config(),
        ));

        ready_rx.await.unwrap();
        shutdown.raise();
        task.await.unwrap();

        let result = rx.recv_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(result, Err(ServerError::NoConnection)));
    }

    #[tokio::test]
    async fn measures_a_stream_until_shutdown() {
        let (tx, rx) = result_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(GoodputServer::run(
            tx,
            shutdown.clone(),
            ready_tx,
            loopback_config(),
        ));

        let addr = ready_rx.await.unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
        let payload = vec![b'x'; 1024];
        let sending = tokio::spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(300);
            while Instant::now() < deadline {
                client.write_all(&payload).await.unwrap();
            }
            client
        });
        let client = sending.await.unwrap();
        shutdown.raise();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("server stops within the poll window")
            .unwrap();
        let goodput = rx
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert!(goodput.is_finite());
        assert!(goodput > 0.0);
        drop(client);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn continuous_stream_does_not_starve_the_runtime() {
        let server = GoodputServer::bind(loopback_config()).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = ShutdownSignal::new();
        let stop = shutdown.clone();
        let serving = tokio::spawn(async move { server.serve(&stop).await });

        let sender = std::thread::spawn(move || {
            use std::io::Write;
            let mut conn = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            let chunk = [b'z'; 64 * 1024];
            while conn.write_all(&chunk).is_ok() {}
        });

        // Ends the test if the drain loop never lets the timer below fire.
        let fallback = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(10));
            fallback.raise();
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let woke_before_stop = !shutdown.is_raised();
        shutdown.raise();

        let m = serving.await.unwrap().unwrap();
        sender.join().unwrap();
        assert!(woke_before_stop, "timer starved while the server drained");
        assert!(m.bytes > 0);
    }

    #[tokio::test]
    async fn peer_close_freezes_the_measurement() {
        let server = GoodputServer::bind(loopback_config()).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = ShutdownSignal::new();
        let stop = shutdown.clone();
        let serving = tokio::spawn(async move { server.serve(&stop).await });

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[7u8; 4096]).await.unwrap();
        drop(client);

        // Leave the server idle past the close before stopping it.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        shutdown.raise();

        let m = serving.await.unwrap().unwrap();
        assert_eq!(m.bytes, 4096);
        assert!(m.elapsed < Duration::from_millis(1500));
        assert!(m.messages >= 4);
    }
}
