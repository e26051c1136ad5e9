//! Deterministic network-fault injection.
//!
//! [`Simulator`] is a UDP relay that sits between two endpoints and applies
//! configurable faults to every datagram passing through: loss, single-bit
//! corruption, delayed reordering, and duplication.  All randomness comes
//! from a seeded generator, so a given seed reproduces the exact same fault
//! pattern — a failing lossy test can be replayed byte for byte.
//!
//! The relay learns the client address from the first datagram that does not
//! come from the upstream endpoint, then forwards in both directions:
//!
//! ```text
//!   client ──▶ 127.0.0.1:<sim> ──▶ upstream
//!          ◀──               ◀──
//! ```
//!
//! Faults are applied per datagram, independently per direction.  The relay
//! never inspects segment contents beyond flipping bits, so it exercises the
//! endpoints exactly as a misbehaving network would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Fault rates are probabilities in `[0, 1]`, evaluated independently for
/// each datagram.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability a datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability one random bit of the datagram is flipped.
    pub corrupt_rate: f64,
    /// Probability a datagram is held back for [`reorder_delay`] while later
    /// traffic overtakes it.
    ///
    /// [`reorder_delay`]: Self::reorder_delay
    pub reorder_rate: f64,
    /// How long a reordered datagram is delayed.
    pub reorder_delay: Duration,
    /// Probability a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Seed for the fault generator.  Equal seeds reproduce equal fault
    /// patterns.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::from_millis(30),
            duplicate_rate: 0.0,
            seed: 1,
        }
    }
}

/// Handle to a running relay task.
pub struct Simulator {
    /// Address the endpoints should talk to instead of each other.
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl Simulator {
    /// Bind a relay on an ephemeral loopback port and start forwarding
    /// toward `upstream`.
    pub async fn start(upstream: SocketAddr, config: SimulatorConfig) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let local_addr = socket.local_addr()?;
        let handle = tokio::spawn(relay(Arc::new(socket), upstream, config));
        Ok(Self { local_addr, handle })
    }

    /// Stop the relay.  In-flight delayed datagrams may still be delivered.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn relay(socket: Arc<UdpSocket>, upstream: SocketAddr, config: SimulatorConfig) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut client: Option<SocketAddr> = None;
    let mut buf = vec![0u8; 65_535];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[sim] recv failed: {e}");
                return;
            }
        };

        let dest = if src == upstream {
            match client {
                Some(addr) => addr,
                // Upstream spoke before any client; nowhere to forward.
                None => continue,
            }
        } else {
            client = Some(src);
            upstream
        };

        let mut datagram = buf[..n].to_vec();

        if rng.gen::<f64>() < config.loss_rate {
            log::trace!("[sim] drop {n}B {src} → {dest}");
            continue;
        }

        if rng.gen::<f64>() < config.corrupt_rate && !datagram.is_empty() {
            let bit = rng.gen_range(0..datagram.len() * 8);
            datagram[bit / 8] ^= 1 << (bit % 8);
            log::trace!("[sim] corrupt bit {bit} of {n}B {src} → {dest}");
        }

        let copies = if rng.gen::<f64>() < config.duplicate_rate {
            log::trace!("[sim] duplicate {n}B {src} → {dest}");
            2
        } else {
            1
        };

        if rng.gen::<f64>() < config.reorder_rate {
            // Hold this datagram back; later traffic overtakes it.
            log::trace!(
                "[sim] delay {n}B {src} → {dest} by {:?}",
                config.reorder_delay
            );
            let socket = Arc::clone(&socket);
            let delay = config.reorder_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for _ in 0..copies {
                    let _ = socket.send_to(&datagram, dest).await;
                }
            });
            continue;
        }

        for _ in 0..copies {
            if let Err(e) = socket.send_to(&datagram, dest).await {
                log::warn!("[sim] forward to {dest} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn clean_relay_forwards_both_directions() {
        let (client, server) = bound_pair().await;
        let sim = Simulator::start(server.local_addr().unwrap(), SimulatorConfig::default())
            .await
            .unwrap();

        client.send_to(b"ping", sim.local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        // Reply travels back through the relay to the client.
        server.send_to(b"pong", from).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn total_loss_drops_everything() {
        let (client, server) = bound_pair().await;
        let sim = Simulator::start(
            server.local_addr().unwrap(),
            SimulatorConfig {
                loss_rate: 1.0,
                ..SimulatorConfig::default()
            },
        )
        .await
        .unwrap();

        client.send_to(b"void", sim.local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), server.recv_from(&mut buf))
                .await
                .is_err();
        assert!(timed_out, "datagram should have been dropped");
    }

    #[tokio::test]
    async fn duplication_delivers_twice() {
        let (client, server) = bound_pair().await;
        let sim = Simulator::start(
            server.local_addr().unwrap(),
            SimulatorConfig {
                duplicate_rate: 1.0,
                ..SimulatorConfig::default()
            },
        )
        .await
        .unwrap();

        client.send_to(b"twice", sim.local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let (n, _) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"twice");
        }
    }

    #[tokio::test]
    async fn corruption_flips_exactly_one_bit() {
        let (client, server) = bound_pair().await;
        let sim = Simulator::start(
            server.local_addr().unwrap(),
            SimulatorConfig {
                corrupt_rate: 1.0,
                ..SimulatorConfig::default()
            },
        )
        .await
        .unwrap();

        let original = [0u8; 8];
        client.send_to(&original, sim.local_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 8);
        let flipped: u32 = buf[..n].iter().map(|b| b.count_ones()).sum();
        assert_eq!(flipped, 1);
    }

    #[tokio::test]
    async fn same_seed_same_fault_pattern() {
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let (client, server) = bound_pair().await;
            let sim = Simulator::start(
                server.local_addr().unwrap(),
                SimulatorConfig {
                    loss_rate: 0.5,
                    seed: 42,
                    ..SimulatorConfig::default()
                },
            )
            .await
            .unwrap();

            let mut pattern = Vec::new();
            let mut buf = [0u8; 16];
            for i in 0..10u8 {
                client.send_to(&[i], sim.local_addr).await.unwrap();
                let arrived = tokio::time::timeout(
                    Duration::from_millis(50),
                    server.recv_from(&mut buf),
                )
                .await
                .is_ok();
                pattern.push(arrived);
            }
            outcomes.push(pattern);
            sim.shutdown();
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }
}
