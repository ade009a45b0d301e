//! RTI side of clock synchronization
//!
//! The RTI only timestamps: it sends T1, waits for the federate's T3, then
//! sends T4 (and over UDP a coded probe right behind it). Federates do the
//! estimation.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;

use cadence_core::{CadenceError, CadenceResult, FederateId};
use cadence_transport::{MessageReader, MessageWriter, UdpTransport};
use cadence_wire::Message;

use crate::Federation;

/// Stray datagrams tolerated while waiting for one T3
pub(crate) const MAX_UNEXPECTED_DATAGRAMS: usize = 5;

/// Initial synchronization over the handshake connection
pub(crate) async fn initial_sync<R, W>(
    federation: &Federation,
    id: FederateId,
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
) -> CadenceResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = federation.config();
    for _ in 0..config.clock_sync_exchanges {
        writer
            .write_message(&Message::ClockSyncT1(federation.now()))
            .await?;
        match reader.read_message_timeout(config.tcp_timeout).await? {
            Message::ClockSyncT3(from) => {
                if from != id {
                    tracing::warn!(federate = %id, claimed = %from, "T3 carries another federate's id");
                }
            }
            other => {
                return Err(CadenceError::UnexpectedMessage {
                    expected: "CLOCK_SYNC_T3",
                    actual: other.name(),
                })
            }
        }
        writer
            .write_message(&Message::ClockSyncT4(federation.now()))
            .await?;
    }
    Ok(())
}

/// Periodic runtime synchronization with every enrolled federate
pub(crate) async fn run(federation: Arc<Federation>, udp: UdpTransport) {
    let mut ticker = tokio::time::interval(federation.config().clock_sync_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(addr = %udp.local_addr(), "runtime clock sync started");

    loop {
        ticker.tick().await;
        for (id, addr) in federation.clock_sync_targets() {
            if let Err(e) = exchange(&federation, &udp, id, addr).await {
                tracing::debug!(federate = %id, error = %e, "clock sync exchange failed");
            }
        }
    }
}

/// One T1 / T3 / T4 + coded probe exchange
async fn exchange(
    federation: &Federation,
    udp: &UdpTransport,
    id: FederateId,
    addr: std::net::SocketAddr,
) -> CadenceResult<()> {
    let timeout = federation.config().udp_timeout;
    udp.send_to(&Message::ClockSyncT1(federation.now()), addr).await?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut unexpected = 0;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let (msg, from) = udp.recv_from_timeout(remaining).await?;
        match msg {
            Message::ClockSyncT3(fed) if fed == id => break,
            other => {
                unexpected += 1;
                tracing::debug!(federate = %id, %from, message = other.name(), "discarding datagram");
                if unexpected >= MAX_UNEXPECTED_DATAGRAMS {
                    return Err(CadenceError::UnexpectedMessage {
                        expected: "CLOCK_SYNC_T3",
                        actual: other.name(),
                    });
                }
            }
        }
    }

    udp.send_to(&Message::ClockSyncT4(federation.now()), addr).await?;
    udp.send_to(&Message::ClockSyncCodedProbe(federation.now()), addr).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use cadence_time::ManualClock;

    use crate::{ClockSyncMode, RtiConfig};

    async fn setup() -> (Arc<Federation>, UdpTransport, UdpTransport) {
        let config = RtiConfig {
            number_of_federates: 1,
            clock_sync: ClockSyncMode::On,
            udp_timeout: Duration::from_millis(200),
            ..RtiConfig::default()
        };
        let federation = Arc::new(Federation::new(config, Arc::new(ManualClock::new(1_000))));
        let rti = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let federate = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (federation, rti, federate)
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let (federation, rti, federate) = setup().await;
        let id = FederateId::new(0);
        let addr = federate.local_addr();

        let task = {
            let federation = federation.clone();
            tokio::spawn(async move { exchange(&federation, &rti, id, addr).await })
        };

        let (msg, from) = federate.recv_from().await.unwrap();
        assert_eq!(msg, Message::ClockSyncT1(1_000));
        federate.send_to(&Message::ClockSyncT3(id), from).await.unwrap();

        assert_eq!(federate.recv_from().await.unwrap().0, Message::ClockSyncT4(1_000));
        assert_eq!(federate.recv_from().await.unwrap().0, Message::ClockSyncCodedProbe(1_000));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_unexpected_datagrams() {
        let (federation, rti, federate) = setup().await;
        let id = FederateId::new(0);
        let addr = federate.local_addr();

        let task = {
            let federation = federation.clone();
            tokio::spawn(async move { exchange(&federation, &rti, id, addr).await })
        };

        let (_, from) = federate.recv_from().await.unwrap();
        for _ in 0..MAX_UNEXPECTED_DATAGRAMS {
            federate.send_to(&Message::ClockSyncT3(FederateId::new(9)), from).await.unwrap();
        }
        assert!(matches!(
            task.await.unwrap(),
            Err(CadenceError::UnexpectedMessage { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_federate_times_out() {
        let (federation, rti, federate) = setup().await;
        let result = exchange(&federation, &rti, FederateId::new(0), federate.local_addr()).await;
        assert!(matches!(result, Err(CadenceError::Timeout(_))));
    }
}
