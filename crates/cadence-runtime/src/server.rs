//! RTI server: accept loop and background tasks

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;

use cadence_core::{CadenceError, CadenceResult};
use cadence_time::{PhysicalClock, SystemClock};
use cadence_transport::{bind_with_retry, UdpTransport};

use crate::{clock_sync, session, ClockSyncMode, Federation, RtiConfig};

pub struct RtiServer {
    federation: Arc<Federation>,
    listener: TcpListener,
    udp: Option<UdpTransport>,
}

impl RtiServer {
    /// Bind the TCP listener (and the UDP socket when runtime clock sync is on)
    pub async fn bind(config: RtiConfig) -> CadenceResult<Self> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn bind_with_clock(config: RtiConfig, clock: Arc<dyn PhysicalClock>) -> CadenceResult<Self> {
        config.validate()?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = bind_with_retry(addr, &config.transport()).await?;

        let udp = if config.clock_sync == ClockSyncMode::On {
            let udp_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
            let udp = UdpTransport::bind(udp_addr)
                .await
                .map_err(|e| CadenceError::fatal("binding clock sync socket", e))?;
            Some(udp)
        } else {
            None
        };

        tracing::info!(
            addr = %listener.local_addr()?,
            federates = config.number_of_federates,
            federation_id = %config.federation_id,
            clock_sync = ?config.clock_sync,
            "RTI listening"
        );

        Ok(RtiServer {
            federation: Arc::new(Federation::new(config, clock)),
            listener,
            udp,
        })
    }

    pub fn local_addr(&self) -> CadenceResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn clock_sync_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().map(UdpTransport::local_addr)
    }

    pub fn federation(&self) -> Arc<Federation> {
        self.federation.clone()
    }

    /// Serve federates until every federate has connected and left
    pub async fn run(self) -> CadenceResult<()> {
        let RtiServer {
            federation,
            listener,
            udp,
        } = self;

        let clock_sync = udp.map(|udp| tokio::spawn(clock_sync::run(federation.clone(), udp)));

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "could not disable Nagle");
                        }
                        tracing::debug!(%peer, "accepted connection");
                        tokio::spawn(session::serve(federation.clone(), stream, peer));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = federation.finished() => break,
            }
        }

        if let Some(task) = clock_sync {
            task.abort();
        }
        tracing::info!("RTI shutting down");
        Ok(())
    }
}
