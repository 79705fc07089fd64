//! Single-writer ingestion handle.
//!
//! The shard's mutating operations assume exactly one writer. This module
//! enforces that at the boundary: a bounded channel whose consumer thread is
//! the only caller of `ingest`, `switch_group_buffers`, `reset` and
//! `shutdown`. Records that fail validation are forwarded to an optional
//! failure channel instead of poisoning the batch.

use crate::shard::{ShardStatus, TimeSeriesShard};
use crate::{IngestRecord, MemShardError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

const COMMAND_QUEUE_DEPTH: usize = 1024;
const FAILURE_QUEUE_DEPTH: usize = 1024;

enum Command {
    Ingest(Vec<IngestRecord>),
    SwitchBuffers(usize),
    Status(Sender<ShardStatus>),
    Reset,
    Shutdown,
}

/// A record rejected before ingestion, published on the failure channel.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub topic: String,
    pub record: IngestRecord,
    pub reason: String,
}

/// Handle to the single ingestion thread of one shard.
///
/// Cloneable producers can be layered on the channel; the consumer thread is
/// the only mutator of shard state. Flush tasks are built through
/// [`TimeSeriesShard::create_flush_task`] and executed elsewhere.
pub struct IngestionHandle {
    shard: Arc<TimeSeriesShard>,
    tx: Sender<Command>,
    done_rx: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionHandle {
    /// Spawns the consumer thread. Returns the handle and, when the failure
    /// channel is enabled in the config, the receiver of rejected records.
    pub fn spawn(shard: Arc<TimeSeriesShard>) -> Result<(Self, Option<Receiver<FailedRecord>>)> {
        let config = shard.config().clone();
        let (tx, rx) = bounded::<Command>(COMMAND_QUEUE_DEPTH);
        let (done_tx, done_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<()>(1);

        let (failure_tx, failure_rx) = if config.failure_channel_enabled {
            let (ftx, frx) = bounded::<FailedRecord>(FAILURE_QUEUE_DEPTH);
            (Some(ftx), Some(frx))
        } else {
            (None, None)
        };

        let consumer_shard = shard.clone();
        let failure_topic = config.failure_topic.clone();
        let value_columns = shard.schema().value_columns.len();

        let thread = thread::spawn(move || {
            let _ = ready_tx.send(());
            Self::consume(
                consumer_shard,
                rx,
                failure_tx,
                failure_topic,
                value_columns,
            );
            let _ = done_tx.send(());
        });

        // The consumer must come up within the connect deadline.
        if ready_rx.recv_timeout(config.connect_timeout()).is_err() {
            return Err(MemShardError::ChannelTimeout {
                timeout_ms: config.connect_timeout_ms,
            });
        }

        info!(shard = shard.shard_num(), "ingestion consumer started");
        Ok((
            Self {
                shard,
                tx,
                done_rx,
                thread: Mutex::new(Some(thread)),
            },
            failure_rx,
        ))
    }

    fn consume(
        shard: Arc<TimeSeriesShard>,
        rx: Receiver<Command>,
        failure_tx: Option<Sender<FailedRecord>>,
        failure_topic: String,
        value_columns: usize,
    ) {
        for command in rx.iter() {
            match command {
                Command::Ingest(records) => {
                    let mut accepted = Vec::with_capacity(records.len());
                    for record in records {
                        let reason = if record.row.values.len() != value_columns {
                            Some(format!(
                                "row has {} value columns, schema expects {value_columns}",
                                record.row.values.len()
                            ))
                        } else {
                            record
                                .labels
                                .iter()
                                .find_map(|label| label.validate().err())
                                .map(|e| e.to_string())
                        };

                        if let Some(reason) = reason {
                            warn!(offset = record.offset, %reason, "record rejected");
                            if let Some(tx) = &failure_tx {
                                let _ = tx.try_send(FailedRecord {
                                    topic: failure_topic.clone(),
                                    record,
                                    reason,
                                });
                            }
                            continue;
                        }
                        accepted.push(record);
                    }
                    if let Err(e) = shard.ingest(&accepted) {
                        error!(error = %e, "ingest batch failed");
                    }
                }
                Command::SwitchBuffers(group) => {
                    if let Err(e) = shard.switch_group_buffers(group) {
                        error!(group, error = %e, "buffer switch failed");
                    }
                }
                Command::Status(reply) => {
                    let _ = reply.send(shard.status());
                }
                Command::Reset => shard.reset(),
                Command::Shutdown => break,
            }
        }
    }

    pub fn shard(&self) -> &Arc<TimeSeriesShard> {
        &self.shard
    }

    /// Enqueues a batch for ingestion.
    pub fn ingest(&self, records: Vec<IngestRecord>) -> Result<()> {
        self.tx.send(Command::Ingest(records))?;
        Ok(())
    }

    /// Enqueues a buffer switch for one group, to run on the ingestion
    /// thread ahead of that group's flush.
    pub fn switch_group_buffers(&self, group: usize) -> Result<()> {
        self.tx.send(Command::SwitchBuffers(group))?;
        Ok(())
    }

    /// Enqueues a reset of the shard's logical state.
    pub fn reset(&self) -> Result<()> {
        self.tx.send(Command::Reset)?;
        Ok(())
    }

    /// Health probe, bounded by the configured status timeout.
    pub fn status(&self) -> Result<ShardStatus> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx.send(Command::Status(reply_tx))?;
        reply_rx
            .recv_timeout(self.shard.config().status_timeout())
            .map_err(|_| MemShardError::ChannelTimeout {
                timeout_ms: self.shard.config().status_timeout_ms,
            })
    }

    /// Drains the queue, stops the consumer and shuts the shard down,
    /// bounded by the configured shutdown timeout.
    pub fn shutdown(self) -> Result<()> {
        self.tx.send(Command::Shutdown)?;

        let timeout = self.shard.config().shutdown_timeout();
        if self.done_rx.recv_timeout(timeout).is_err() {
            warn!("ingestion consumer did not stop within the shutdown deadline");
            return Err(MemShardError::ChannelTimeout {
                timeout_ms: self.shard.config().shutdown_timeout_ms,
            });
        }

        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.shard.shutdown();
        Ok(())
    }
}
