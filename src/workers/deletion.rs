//! Deletion worker: full purge of a chapter's transcoding footprint.
//!
//! Rendition rows, every object under the chapter's transcode prefix, and
//! cached playlists/segments all go; a row-only purge would leave orphaned
//! artifacts serving 404-adjacent garbage from the cache.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::models::ChapterDeletion;
use crate::queue::broker::DELETION_QUEUE;
use crate::queue::Broker;
use crate::repo;
use crate::services::StreamCache;
use crate::storage::ObjectStorage;

pub struct DeletionWorker {
    db: PgPool,
    broker: Arc<Broker>,
    storage: Arc<dyn ObjectStorage>,
    cache: Arc<StreamCache>,
}

impl DeletionWorker {
    pub fn new(
        db: PgPool,
        broker: Arc<Broker>,
        storage: Arc<dyn ObjectStorage>,
        cache: Arc<StreamCache>,
    ) -> Self {
        Self {
            db,
            broker,
            storage,
            cache,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut consumer = match self.broker.consumer(DELETION_QUEUE, "deletion-worker").await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to consume {}: {}; retrying in 5s", DELETION_QUEUE, e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    continue;
                }
            };
            info!("Deletion worker listening on {}", DELETION_QUEUE);

            loop {
                let delivery = tokio::select! {
                    delivery = consumer.next() => delivery,
                    _ = shutdown.changed() => break,
                };
                let Some(delivery) = delivery else { break };

                match delivery {
                    Ok(delivery) => {
                        let deletion =
                            match serde_json::from_slice::<ChapterDeletion>(&delivery.data) {
                                Ok(deletion) => deletion,
                                Err(e) => {
                                    error!("Unparseable deletion message: {}", e);
                                    let _ = delivery.ack(BasicAckOptions::default()).await;
                                    continue;
                                }
                            };

                        match self.purge(&deletion.chapter_id).await {
                            Ok(()) => {
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    error!("Failed to ack deletion: {}", e);
                                }
                            }
                            Err(e) => {
                                // One redelivery for transient errors, then drop
                                // rather than poison the queue.
                                if delivery.redelivered {
                                    error!(
                                        chapter_id = %deletion.chapter_id,
                                        "Purge failed twice, dropping: {}", e
                                    );
                                    let _ = delivery.ack(BasicAckOptions::default()).await;
                                } else {
                                    warn!(
                                        chapter_id = %deletion.chapter_id,
                                        "Purge failed, requeueing: {}", e
                                    );
                                    let _ = delivery
                                        .nack(BasicNackOptions {
                                            requeue: true,
                                            ..BasicNackOptions::default()
                                        })
                                        .await;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Deletion consumer error: {}", e);
                        tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            warn!("Deletion consumer stopped, reconnecting");
        }
        info!("Deletion worker stopped");
    }

    async fn purge(&self, chapter_id: &str) -> Result<()> {
        let bitrates = repo::renditions::bitrates_for_chapter(&self.db, chapter_id).await?;

        let rows = repo::renditions::delete_for_chapter(&self.db, chapter_id).await?;
        // Trailing slash keeps the purge delimiter-bound: chapter ids are
        // opaque strings, and an S3 listing for "bit_transcode/ch-1" would
        // also sweep up "bit_transcode/ch-10/...".
        let objects = self
            .storage
            .delete_prefix(&format!("bit_transcode/{}/", chapter_id))
            .await?;
        let cached = self.cache.purge_chapter(chapter_id, &bitrates).await?;

        info!(
            chapter_id,
            rows, objects, cached, "Purged chapter renditions, artifacts and cache entries"
        );
        Ok(())
    }
}
