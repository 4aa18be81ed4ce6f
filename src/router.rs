//! Audience selection and fan-out delivery of envelopes.

use std::{collections::BTreeSet, future::Future};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    directory::{Directory, NodeAddr},
    proto::{Meeting, NodeId},
};

/// Delivery channel used by the router to reach one addressee.
///
/// Implementations are best-effort and connection-per-envelope; the
/// message boundary is end of transmission.
pub trait Transport: Send + Sync + 'static {
    /// Delivers one envelope to `addr`.
    fn deliver(&self, addr: &NodeAddr, envelope: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Which addressees a submission reached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Addressees the envelope was handed to.
    pub sent: Vec<NodeId>,
    /// Addressees that could not be reached (unknown to the directory,
    /// or the transport failed). Never retried.
    pub failed: Vec<NodeId>,
}

/// Fans submitted envelopes out to exactly the nodes they concern.
///
/// The router holds no durable state of its own; the injected
/// [`Directory`] is the only thing it consults besides the envelope.
#[derive(Debug, Clone)]
pub struct Router<T> {
    directory: Directory,
    transport: T,
}

impl<T: Transport> Router<T> {
    /// Creates a router over the given directory and transport.
    pub fn new(directory: Directory, transport: T) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// The audience of an envelope: organizer plus invitees, read from
    /// the envelope's own fields, never from stored state. A tombstone
    /// narrowed to the removed invitees therefore does not reach the
    /// organizer or the remaining invitees.
    pub fn audience(meeting: &Meeting) -> BTreeSet<NodeId> {
        let mut audience = meeting.invitees.clone();
        audience.insert(meeting.organizer.clone());
        audience
    }

    /// Submits one envelope: decodes it, computes the audience and
    /// delivers a copy to each addressee independently and concurrently,
    /// so a stalled addressee delays only its own attempt.
    ///
    /// An undecodable payload fails the submission and is dropped.
    /// Per-addressee delivery failures are logged and collected in the
    /// returned [`Delivery`]; they never fail the submission, block the
    /// other addressees, or get retried.
    pub async fn submit(&self, payload: &str) -> Result<Delivery> {
        let meeting = Meeting::decode(payload).context("dropping undecodable submission")?;
        let id = meeting.id;
        let attempts = Self::audience(&meeting).into_iter().map(|node| {
            let addr = self.directory.resolve(&node);
            async move {
                let Some(addr) = addr else {
                    warn!(%node, "no directory entry, skipping delivery");
                    return (node, false);
                };
                match self.transport.deliver(&addr, payload).await {
                    Ok(()) => {
                        debug!(%node, %addr, id = %id.fmt_short(), "delivered envelope");
                        (node, true)
                    }
                    Err(err) => {
                        warn!(%node, %addr, "delivery failed: {err:#}");
                        (node, false)
                    }
                }
            }
        });

        let mut delivery = Delivery::default();
        for (node, reached) in join_all(attempts).await {
            if reached {
                delivery.sent.push(node);
            } else {
                delivery.failed.push(node);
            }
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{Arc, Mutex},
    };

    use anyhow::bail;
    use time::macros::datetime;

    use super::*;

    /// Records deliveries instead of sending them; hosts listed in
    /// `unreachable` fail.
    #[derive(Debug, Default, Clone)]
    struct RecordingTransport {
        delivered: Arc<Mutex<Vec<(NodeAddr, String)>>>,
        unreachable: Vec<String>,
    }

    impl Transport for RecordingTransport {
        async fn deliver(&self, addr: &NodeAddr, envelope: &str) -> Result<()> {
            if self.unreachable.contains(&addr.host) {
                bail!("host {} unreachable", addr.host);
            }
            self.delivered
                .lock()
                .unwrap()
                .push((addr.clone(), envelope.to_string()));
            Ok(())
        }
    }

    fn sample() -> Meeting {
        Meeting::new(
            "Review",
            NodeId::new("Alice_White"),
            BTreeSet::from([NodeId::new("Bob_Smith"), NodeId::new("Carol_Simpson")]),
            "Room 3",
            datetime!(2026-09-03 14:00:00),
            datetime!(2026-09-03 15:00:00),
        )
    }

    fn directory() -> Directory {
        Directory::from_entries([
            (NodeId::new("Alice_White"), 9091),
            (NodeId::new("Bob_Smith"), 9092),
            (NodeId::new("Carol_Simpson"), 9093),
            (NodeId::new("Eva_Brown"), 9095),
        ])
    }

    #[tokio::test]
    async fn delivers_to_exactly_the_audience() -> Result<()> {
        let transport = RecordingTransport::default();
        let router = Router::new(directory(), transport.clone());
        let payload = sample().encode()?;

        let delivery = router.submit(&payload).await?;
        assert_eq!(delivery.sent.len(), 3);
        assert!(delivery.failed.is_empty());

        let delivered = transport.delivered.lock().unwrap();
        let hosts: BTreeSet<&str> = delivered.iter().map(|(addr, _)| addr.host.as_str()).collect();
        assert_eq!(
            hosts,
            BTreeSet::from(["alice-white-server", "bob-smith-server", "carol-simpson-server"])
        );
        // Eva is not in the audience and must not receive a copy.
        assert!(!hosts.contains("eva-brown-server"));
        // The payload is forwarded untouched.
        assert!(delivered.iter().all(|(_, envelope)| *envelope == payload));
        Ok(())
    }

    #[tokio::test]
    async fn tombstone_audience_is_read_from_the_envelope() -> Result<()> {
        let transport = RecordingTransport::default();
        let router = Router::new(directory(), transport.clone());

        let mut tombstone = sample();
        tombstone.invitees = BTreeSet::from([NodeId::new("Carol_Simpson")]);
        tombstone.deleted = true;
        tombstone.last_modified = 1;

        router.submit(&tombstone.encode()?).await?;
        let delivered = transport.delivered.lock().unwrap();
        let hosts: BTreeSet<&str> = delivered.iter().map(|(addr, _)| addr.host.as_str()).collect();
        // Organizer plus the listed invitee only; Bob is not addressed.
        assert_eq!(hosts, BTreeSet::from(["alice-white-server", "carol-simpson-server"]));
        Ok(())
    }

    #[tokio::test]
    async fn one_failed_addressee_does_not_block_the_rest() -> Result<()> {
        let transport = RecordingTransport {
            unreachable: vec!["bob-smith-server".to_string()],
            ..Default::default()
        };
        let router = Router::new(directory(), transport.clone());

        let delivery = router.submit(&sample().encode()?).await?;
        assert_eq!(delivery.sent.len(), 2);
        assert_eq!(delivery.failed, vec![NodeId::new("Bob_Smith")]);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_addressee_is_reported_not_fatal() -> Result<()> {
        let transport = RecordingTransport::default();
        let directory = Directory::from_entries([(NodeId::new("Alice_White"), 9091)]);
        let router = Router::new(directory, transport);

        let delivery = router.submit(&sample().encode()?).await?;
        assert_eq!(delivery.sent, vec![NodeId::new("Alice_White")]);
        assert_eq!(delivery.failed.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn stalled_addressee_does_not_delay_the_rest() -> Result<()> {
        // Every delivery parks until all three are in flight; if they
        // were awaited one after the other this would never complete.
        #[derive(Debug, Clone)]
        struct BarrierTransport {
            barrier: Arc<tokio::sync::Barrier>,
        }

        impl Transport for BarrierTransport {
            async fn deliver(&self, _addr: &NodeAddr, _envelope: &str) -> Result<()> {
                self.barrier.wait().await;
                Ok(())
            }
        }

        let transport = BarrierTransport {
            barrier: Arc::new(tokio::sync::Barrier::new(3)),
        };
        let router = Router::new(directory(), transport);
        let delivery = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            router.submit(&sample().encode()?),
        )
        .await??;
        assert_eq!(delivery.sent.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_submission_is_rejected() {
        let router = Router::new(directory(), RecordingTransport::default());
        assert!(router.submit("TOPIC=broken").await.is_err());
    }
}
