use bytes::Bytes;
use goodput_lab_abstract::CongestionControl;
use rand::Rng;
use rand::distr::Alphanumeric;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, error, info};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("congestion control '{algorithm}' is not available on this host: {source}")]
    CongestionControl {
        algorithm: CongestionControl,
        #[source]
        source: io::Error,
    },
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("send failed after {sent} bytes: {source}")]
    Send {
        sent: u64,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub congestion_control: CongestionControl,
    pub packet_size: usize,
    pub address: IpAddr,
    pub port: u16,
}

impl ClientConfig {
    pub fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Saturating sender: one connection, one payload, written back to back.
pub struct LoadClient {
    config: ClientConfig,
}

impl LoadClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connects and sends until a write fails. There is no other exit: the
    /// process is expected to be terminated from outside when the trial ends.
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut stream = self.connect().await?;
        let payload = random_payload(self.config.packet_size);

        let mut sent: u64 = 0;
        let mut last_heartbeat = Instant::now();
        loop {
            if let Err(source) = stream.write_all(&payload).await {
                error!(sent, "send failed: {}", source);
                return Err(ClientError::Send { sent, source });
            }
            sent += payload.len() as u64;

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                info!(sent, cc = %self.config.congestion_control, "Client heartbeat");
                last_heartbeat = Instant::now();
            }
        }
    }

    /// Opens the socket, selects the algorithm, then connects.
    pub async fn connect(&self) -> Result<TcpStream, ClientError> {
        let addr = self.config.server_addr();
        let socket = open_socket(addr, self.config.congestion_control)?;
        socket.set_nonblocking(true).map_err(ClientError::Socket)?;

        let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
        debug!(%addr, "connecting");
        match socket.connect(addr).await {
            Ok(stream) => {
                info!(%addr, cc = %self.config.congestion_control, "connection established");
                Ok(stream)
            }
            Err(source) => {
                error!(%addr, "cannot connect: {}", source);
                Err(ClientError::Connect { addr, source })
            }
        }
    }
}

/// Creates an unconnected TCP socket with `algorithm` applied.
///
/// The algorithm has to be chosen before `connect`, so it is set here.
pub fn open_socket(addr: SocketAddr, algorithm: CongestionControl) -> Result<Socket, ClientError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ClientError::Socket)?;
    set_congestion_control(&socket, algorithm)?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn set_congestion_control(socket: &Socket, algorithm: CongestionControl) -> Result<(), ClientError> {
    socket
        .set_tcp_congestion(algorithm.as_str().as_bytes())
        .map_err(|source| ClientError::CongestionControl { algorithm, source })
}

#[cfg(not(target_os = "linux"))]
fn set_congestion_control(_socket: &Socket, algorithm: CongestionControl) -> Result<(), ClientError> {
    Err(ClientError::CongestionControl {
        algorithm,
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP_CONGESTION is only available on Linux",
        ),
    })
}

/// Random ASCII letters and digits, generated once per client.
pub fn random_payload(size: usize) -> Bytes {
    let payload: Vec<u8> = rand::rng()
        .sample_iter(Alphanumeric)
        .take(size)
        .collect();
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn payload_has_the_requested_size() {
        let payload = random_payload(1024);
        assert_eq!(payload.len(), 1024);
        assert!(payload.iter().all(u8::is_ascii_alphanumeric));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reno_is_always_selectable() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9));
        let socket = open_socket(addr, CongestionControl::Reno).unwrap();
        // The kernel pads the name with NULs up to TCP_CA_NAME_MAX.
        let name = socket.tcp_congestion().unwrap();
        assert_eq!(name.split(|b| *b == 0).next(), Some(&b"reno"[..]));
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = LoadClient::new(ClientConfig {
            congestion_control: CongestionControl::Reno,
            packet_size: 64,
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        });
        let err = client.run().await.unwrap_err();
        if cfg!(target_os = "linux") {
            assert!(matches!(err, ClientError::Connect { .. }));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn sends_until_the_peer_goes_away() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let receiver = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            while total < 256 * 1024 {
                let n = conn.read(&mut buf).await.unwrap();
                assert!(n > 0);
                total += n;
            }
            total
        });

        let client = LoadClient::new(ClientConfig {
            congestion_control: CongestionControl::Reno,
            packet_size: 1024,
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        });
        let err = tokio::time::timeout(Duration::from_secs(10), client.run())
            .await
            .expect("client stops once the receiver closes")
            .unwrap_err();

        assert!(receiver.await.unwrap() >= 256 * 1024);
        match err {
            ClientError::Send { sent, .. } => assert!(sent >= 256 * 1024),
            other => panic!("unexpected error: {other}"),
        }
    }
}
