//! Durable broker backed by a spool directory.
//!
//! Each topic owns three directories under the spool root:
//!
//! - `ready/` holds published messages, one JSON file each, named so that
//!   lexical order is publish order
//! - `inflight/` holds claimed messages; the file name is prefixed with the
//!   visibility deadline in unix milliseconds
//! - `dead/` holds messages nacked without requeue
//!
//! Every state change is a single `rename`, so several consumer processes can
//! share one spool. A consumer that loses a claim race sees `NotFound` and
//! moves on to the next file. Claims whose deadline passed are moved back to
//! `ready/` by whichever consumer fetches next.
//!
//! A broker never expires its own claims. While it is open it renews them on
//! every fetch once half of the visibility timeout has elapsed, so only claims
//! left behind by a consumer that stopped fetching are redelivered.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, DeliveryTag, RawDelivery};
use crate::error::BrokerError;

const READY_DIR: &str = "ready";
const INFLIGHT_DIR: &str = "inflight";
const DEAD_DIR: &str = "dead";

/// Tie-breaker for messages published within the same clock tick.
static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Tuning knobs for [`SpoolBroker`].
#[derive(Debug, Clone)]
pub struct SpoolOptions {
    /// How long a claimed message stays invisible to other consumers.
    pub visibility_timeout: Duration,
    /// Sleep between directory scans while waiting for messages.
    pub poll_interval: Duration,
}

impl Default for SpoolOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
struct TopicDirs {
    root: PathBuf,
    ready: PathBuf,
    inflight: PathBuf,
    dead: PathBuf,
}

/// A message this broker holds in `inflight/`.
#[derive(Debug, Clone)]
struct Claim {
    topic: String,
    /// Current file name; changes when the claim is renewed.
    file: String,
    deadline: u64,
}

impl Claim {
    fn ready_name(&self) -> Option<&str> {
        split_claim(&self.file).map(|(_, name)| name)
    }
}

/// Broker storing messages as files in a shared directory tree.
#[derive(Debug)]
pub struct SpoolBroker {
    root: PathBuf,
    options: SpoolOptions,
    /// Claims made by this broker, keyed by the tag handed to the consumer.
    claims: Mutex<HashMap<DeliveryTag, Claim>>,
    /// Serializes renames of claimed files so a renewal never races a settle.
    claim_io: AsyncMutex<()>,
    closed: AtomicBool,
}

impl SpoolBroker {
    pub fn new(root: impl Into<PathBuf>, options: SpoolOptions) -> Self {
        Self {
            root: root.into(),
            options,
            claims: Mutex::new(HashMap::new()),
            claim_io: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of ready messages on `topic`.
    pub async fn ready_len(&self, topic: &str) -> Result<usize, BrokerError> {
        let dirs = self.topic_dirs(topic).await?;
        Ok(list_json(&dirs.ready).await?.len())
    }

    /// Number of claimed, unacked messages on `topic`.
    pub async fn in_flight_len(&self, topic: &str) -> Result<usize, BrokerError> {
        let dirs = self.topic_dirs(topic).await?;
        Ok(list_json(&dirs.inflight).await?.len())
    }

    /// Number of dead-lettered messages on `topic`.
    pub async fn dead_len(&self, topic: &str) -> Result<usize, BrokerError> {
        let dirs = self.topic_dirs(topic).await?;
        Ok(list_json(&dirs.dead).await?.len())
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn claims(&self) -> Result<MutexGuard<'_, HashMap<DeliveryTag, Claim>>, BrokerError> {
        self.claims
            .lock()
            .map_err(|_| BrokerError::Backend("spool claim table poisoned".into()))
    }

    async fn topic_dirs(&self, topic: &str) -> Result<TopicDirs, BrokerError> {
        if topic.is_empty()
            || topic.starts_with('.')
            || topic.contains(|c| matches!(c, '/' | '\\'))
        {
            return Err(BrokerError::Backend(format!("invalid topic name: {topic:?}")));
        }
        let root = self.root.join(topic);
        let dirs = TopicDirs {
            ready: root.join(READY_DIR),
            inflight: root.join(INFLIGHT_DIR),
            dead: root.join(DEAD_DIR),
            root,
        };
        fs::create_dir_all(&dirs.ready).await?;
        fs::create_dir_all(&dirs.inflight).await?;
        fs::create_dir_all(&dirs.dead).await?;
        Ok(dirs)
    }

    fn visibility_millis(&self) -> u64 {
        self.options.visibility_timeout.as_millis() as u64
    }

    /// Push back the deadline of this broker's claims on `topic` once half of
    /// their visibility window has passed.
    async fn renew_own_claims(&self, topic: &str, dirs: &TopicDirs) -> Result<(), BrokerError> {
        let _io = self.claim_io.lock().await;
        let now = unix_millis();
        let visibility = self.visibility_millis();
        let due: Vec<(DeliveryTag, Claim)> = self
            .claims()?
            .iter()
            .filter(|(_, claim)| {
                claim.topic == topic && claim.deadline.saturating_sub(now) < visibility / 2
            })
            .map(|(tag, claim)| (tag.clone(), claim.clone()))
            .collect();

        for (tag, claim) in due {
            let Some(ready_name) = claim.ready_name() else {
                continue;
            };
            let deadline = now + visibility;
            let renewed = format!("{deadline:013}.{ready_name}");
            match fs::rename(dirs.inflight.join(&claim.file), dirs.inflight.join(&renewed)).await {
                Ok(()) => {
                    if let Some(entry) = self.claims()?.get_mut(&tag) {
                        entry.file = renewed;
                        entry.deadline = deadline;
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Another consumer already requeued it; the ack will fail.
                    warn!(%tag, "claim lost before it could be renewed");
                    self.claims()?.remove(&tag);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Move other consumers' expired claims back to `ready/`.
    async fn requeue_expired(&self, dirs: &TopicDirs) -> Result<(), BrokerError> {
        let now = unix_millis();
        let own: HashSet<String> = self
            .claims()?
            .values()
            .map(|claim| claim.file.clone())
            .collect();
        for name in list_json(&dirs.inflight).await? {
            if own.contains(&name) {
                continue;
            }
            let Some((deadline, ready_name)) = split_claim(&name) else {
                continue;
            };
            if deadline > now {
                continue;
            }
            match fs::rename(dirs.inflight.join(&name), dirs.ready.join(ready_name)).await {
                Ok(()) => {
                    debug!(message = ready_name, "visibility timeout expired, message requeued");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Try to claim the oldest ready message.
    async fn claim_next(
        &self,
        topic: &str,
        dirs: &TopicDirs,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let deadline = unix_millis() + self.visibility_millis();
        for name in list_json(&dirs.ready).await? {
            let claimed = format!("{deadline:013}.{name}");
            match fs::rename(dirs.ready.join(&name), dirs.inflight.join(&claimed)).await {
                Ok(()) => {
                    let body = fs::read(dirs.inflight.join(&claimed)).await?;
                    let tag = DeliveryTag::new(claimed.as_str());
                    self.claims()?.insert(
                        tag.clone(),
                        Claim {
                            topic: topic.to_owned(),
                            file: claimed,
                            deadline,
                        },
                    );
                    return Ok(Some(RawDelivery { tag, body }));
                }
                // Another consumer won the race for this file.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn settle(
        &self,
        topic: &str,
        tag: &DeliveryTag,
        target: Option<&Path>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let dirs = self.topic_dirs(topic).await?;
        let _io = self.claim_io.lock().await;
        let claim = self
            .claims()?
            .remove(tag)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;
        let claimed = dirs.inflight.join(&claim.file);
        let result = match target {
            Some(target_dir) => {
                let ready_name = claim
                    .ready_name()
                    .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;
                fs::rename(&claimed, target_dir.join(ready_name)).await
            }
            None => fs::remove_file(&claimed).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BrokerError::UnknownDelivery(tag.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Broker for SpoolBroker {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let dirs = self.topic_dirs(topic).await?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = format!("{nanos:020}-{seq:010}-{}.json", Uuid::new_v4().simple());
        let tmp = dirs.root.join(format!(".{name}.tmp"));
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, dirs.ready.join(&name)).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        topic: &str,
        wait: Duration,
    ) -> Result<Option<RawDelivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let dirs = self.topic_dirs(topic).await?;
        loop {
            self.ensure_open()?;
            self.renew_own_claims(topic, &dirs).await?;
            self.requeue_expired(&dirs).await?;
            if let Some(delivery) = self.claim_next(topic, &dirs).await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, topic: &str, tag: &DeliveryTag) -> Result<(), BrokerError> {
        self.settle(topic, tag, None).await
    }

    async fn nack(
        &self,
        topic: &str,
        tag: &DeliveryTag,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let dirs = self.topic_dirs(topic).await?;
        let target = if requeue { dirs.ready } else { dirs.dead };
        self.settle(topic, tag, Some(&target)).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _io = self.claim_io.lock().await;
        let claims: Vec<(DeliveryTag, Claim)> = self.claims()?.drain().collect();
        for (tag, claim) in claims {
            let dirs = self.topic_dirs(&claim.topic).await?;
            let Some(ready_name) = claim.ready_name() else {
                continue;
            };
            match fs::rename(dirs.inflight.join(&claim.file), dirs.ready.join(ready_name)).await
            {
                Ok(()) => debug!(%tag, "released unacked message on close"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(%tag, error = %e, "failed to release unacked message"),
            }
        }
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Split `"<deadline>.<ready name>"` into its parts.
fn split_claim(name: &str) -> Option<(u64, &str)> {
    let (deadline, rest) = name.split_once('.')?;
    Some((deadline.parse().ok()?, rest))
}

/// Sorted `*.json` file names in `dir`, skipping temp files.
async fn list_json(dir: &Path) -> Result<Vec<String>, BrokerError> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".json") && !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
    }
    names.sort_unstable();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "grader-submissions";

    fn broker(dir: &Path, visibility: Duration) -> SpoolBroker {
        SpoolBroker::new(
            dir,
            SpoolOptions {
                visibility_timeout: visibility,
                poll_interval: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn test_publish_fetch_ack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = broker(dir.path(), Duration::from_secs(60));

        spool.publish(TOPIC, b"first".to_vec()).await.unwrap();
        spool.publish(TOPIC, b"second".to_vec()).await.unwrap();
        assert_eq!(spool.ready_len(TOPIC).await.unwrap(), 2);

        let delivery = spool
            .fetch(TOPIC, Duration::ZERO)
            .await
            .unwrap()
            .expect("message");
        assert_eq!(delivery.body, b"first");
        assert_eq!(spool.in_flight_len(TOPIC).await.unwrap(), 1);

        spool.ack(TOPIC, &delivery.tag).await.unwrap();
        assert_eq!(spool.in_flight_len(TOPIC).await.unwrap(), 0);
        assert_eq!(spool.ready_len(TOPIC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nack_moves_to_ready_or_dead() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = broker(dir.path(), Duration::from_secs(60));
        spool.publish(TOPIC, b"job".to_vec()).await.unwrap();

        let first = spool.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();
        spool.nack(TOPIC, &first.tag, true).await.unwrap();
        assert_eq!(spool.ready_len(TOPIC).await.unwrap(), 1);

        let second = spool.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();
        spool.nack(TOPIC, &second.tag, false).await.unwrap();
        assert_eq!(spool.ready_len(TOPIC).await.unwrap(), 0);
        assert_eq!(spool.dead_len(TOPIC).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_claim_is_redelivered_to_another_consumer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let crashed = broker(dir.path(), Duration::from_millis(30));
        let survivor = broker(dir.path(), Duration::from_secs(60));

        crashed.publish(TOPIC, b"job".to_vec()).await.unwrap();
        let lost = crashed.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();
        assert!(survivor
            .fetch(TOPIC, Duration::ZERO)
            .await
            .unwrap()
            .is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = survivor
            .fetch(TOPIC, Duration::ZERO)
            .await
            .unwrap()
            .expect("redelivered after visibility timeout");
        assert_eq!(redelivered.body, b"job");

        // The original claim is gone, so its ack no longer counts.
        assert!(matches!(
            crashed.ack(TOPIC, &lost.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_own_claim_is_renewed_not_redelivered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = broker(dir.path(), Duration::from_millis(40));
        let other = broker(dir.path(), Duration::from_secs(60));

        worker.publish(TOPIC, b"slow job".to_vec()).await.unwrap();
        let held = worker.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();

        // Keep fetching past several visibility windows while the job is held.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert!(worker.fetch(TOPIC, Duration::ZERO).await.unwrap().is_none());
            assert!(other.fetch(TOPIC, Duration::ZERO).await.unwrap().is_none());
        }
        assert_eq!(worker.in_flight_len(TOPIC).await.unwrap(), 1);

        worker.ack(TOPIC, &held.tag).await.unwrap();
        assert_eq!(worker.in_flight_len(TOPIC).await.unwrap(), 0);
        assert_eq!(worker.ready_len(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settle_after_renewal_uses_current_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = broker(dir.path(), Duration::from_millis(20));
        spool.publish(TOPIC, b"job".to_vec()).await.unwrap();
        let held = spool.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(spool.fetch(TOPIC, Duration::ZERO).await.unwrap().is_none());

        spool.nack(TOPIC, &held.tag, false).await.unwrap();
        assert_eq!(spool.in_flight_len(TOPIC).await.unwrap(), 0);
        assert_eq!(spool.dead_len(TOPIC).await.unwrap(), 1);
        assert!(matches!(
            spool.ack(TOPIC, &held.tag).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_close_releases_own_claims() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = broker(dir.path(), Duration::from_secs(60));
        spool.publish(TOPIC, b"job".to_vec()).await.unwrap();
        let _unacked = spool.fetch(TOPIC, Duration::ZERO).await.unwrap().unwrap();

        spool.close().await.unwrap();
        assert_eq!(spool.ready_len(TOPIC).await.unwrap(), 1);
        assert_eq!(spool.in_flight_len(TOPIC).await.unwrap(), 0);
        assert!(matches!(
            spool.publish(TOPIC, b"more".to_vec()).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_topic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = broker(dir.path(), Duration::from_secs(60));
        assert!(spool.publish("../escape", b"x".to_vec()).await.is_err());
    }

    #[test]
    fn test_split_claim() {
        assert_eq!(
            split_claim("0000000001234.000001-abc.json"),
            Some((1234, "000001-abc.json"))
        );
        assert_eq!(split_claim("garbage"), None);
    }
}
