use anyhow::Result;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use shared::*;
use crate::dispatcher::CommandDispatcher;
use crate::models::ProcessedCommand;
use crate::store::InventoryStore;

/// Applies command envelopes exactly once per idempotency key.
pub struct CommandProcessor<S> {
    store: Arc<S>,
    dispatcher: CommandDispatcher<S>,
}

impl<S: InventoryStore> CommandProcessor<S> {
    pub fn new(store: Arc<S>, dispatcher: CommandDispatcher<S>) -> Self {
        Self { store, dispatcher }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S> {
        &self.dispatcher
    }

    /// Runs one envelope and builds its reply.
    ///
    /// Rejected commands and storage failures both get a failed reply and
    /// are not recorded, so a caller may resend the same envelope. A command
    /// that was applied but could not be recorded still replies success.
    pub async fn process(&self, envelope: &CommandEnvelope) -> Result<CommandReply> {
        match self.store.processed_command(&envelope.idempotency_key).await {
            Ok(Some(existing)) => {
                info!("Command already processed, returning cached result");
                return Ok(CommandReply::success(envelope.id, existing.result));
            }
            Ok(None) => {}
            Err(e) => {
                error!("Error checking idempotency for {}: {}", envelope.idempotency_key, e);
                return Ok(CommandReply::failed(envelope.id, e.to_string()));
            }
        }

        let reply = match self.dispatcher.execute(envelope.command.clone()).await {
            Ok(result) => CommandReply::success(envelope.id, Some(serde_json::to_value(result)?)),
            Err(e) if e.is_validation() => {
                warn!("Rejected {} command for {}: {}", envelope.command.name(), envelope.command.key(), e);
                return Ok(CommandReply::failed(envelope.id, e.to_string()));
            }
            Err(e) => {
                error!("Failed {} command for {}: {}", envelope.command.name(), envelope.command.key(), e);
                return Ok(CommandReply::failed(envelope.id, e.to_string()));
            }
        };

        if let Err(e) = self.store_processed_command(envelope, &reply).await {
            warn!("Command {} applied but not recorded: {}", envelope.id, e);
        }
        Ok(reply)
    }

    async fn store_processed_command(&self, envelope: &CommandEnvelope, reply: &CommandReply) -> Result<()> {
        let processed_command = ProcessedCommand {
            idempotency_key: envelope.idempotency_key.clone(),
            command_id: envelope.id,
            result: reply.result.clone(),
            processed_at: Some(chrono::Utc::now()),
        };
        self.store.record_processed_command(&processed_command).await?;
        Ok(())
    }
}

/// Kafka transport around a [`CommandProcessor`].
pub struct CommandHandler<S> {
    processor: CommandProcessor<S>,
    producer: FutureProducer,
    reply_topic: String,
}

impl<S: InventoryStore> CommandHandler<S> {
    pub fn new(processor: CommandProcessor<S>, producer: FutureProducer, reply_topic: String) -> Self {
        Self { processor, producer, reply_topic }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<CommandEnvelope>(json_str) {
                                Ok(envelope) => {
                                    if let Err(e) = self.handle_command(envelope).await {
                                        error!("Error handling command: {}", e);
                                    }
                                }
                                Err(e) => error!("Error decoding command envelope: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_command(&self, envelope: CommandEnvelope) -> Result<()> {
        let reply = self.processor.process(&envelope).await?;
        self.send_reply(&envelope, reply).await
    }

    async fn send_reply(&self, envelope: &CommandEnvelope, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = envelope.command.key().to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capabilities;
    use crate::store::InMemoryInventoryStore;

    fn processor() -> (Arc<InMemoryInventoryStore>, CommandProcessor<InMemoryInventoryStore>) {
        let store = Arc::new(InMemoryInventoryStore::new());
        let dispatcher = CommandDispatcher::new(store.clone(), Capabilities::default());
        (store.clone(), CommandProcessor::new(store, dispatcher))
    }

    #[tokio::test]
    async fn duplicate_envelope_is_applied_once() {
        let (store, processor) = processor();
        let key = InventoryKey::new("SKU-1", 1);
        let envelope = CommandEnvelope::new(InventoryCommand::Allocate { key: key.clone(), quantity: 2 });

        let first = processor.process(&envelope).await.unwrap();
        let second = processor.process(&envelope).await.unwrap();

        assert_eq!(first.status, CommandStatus::Success);
        assert_eq!(second.status, CommandStatus::Success);
        assert_eq!(first.result, second.result);
        assert_eq!(first.result, Some(serde_json::json!({ "quantity": 2 })));
        assert_eq!(store.journal_entries(&key).await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_command_is_not_recorded() {
        let (store, processor) = processor();
        let envelope = CommandEnvelope::new(InventoryCommand::Release {
            key: InventoryKey::new("SKU-1", 1),
            quantity: 0,
        });

        let reply = processor.process(&envelope).await.unwrap();
        assert_eq!(reply.status, CommandStatus::Failed);
        assert!(reply.error.unwrap().contains("must be positive"));
        assert!(store.processed_command(&envelope.idempotency_key).await.unwrap().is_none());
    }

    mod flaky {
        use std::sync::atomic::{AtomicBool, Ordering};

        use async_trait::async_trait;
        use shared::InventoryKey;

        use crate::error::{StoreError, StoreResult};
        use crate::models::*;
        use crate::store::{InMemoryInventoryStore, InventoryStore, RolledUpInventory, UnitOfWork};

        /// Memory store whose journal appends fail while `journal_down` is set.
        #[derive(Default)]
        pub struct FlakyJournalStore {
            pub inner: InMemoryInventoryStore,
            pub journal_down: AtomicBool,
        }

        impl FlakyJournalStore {
            pub fn set_journal_down(&self, down: bool) {
                self.journal_down.store(down, Ordering::SeqCst);
            }
        }

        #[async_trait]
        impl InventoryStore for FlakyJournalStore {
            async fn get_base(&self, key: &InventoryKey) -> StoreResult<Option<Inventory>> {
                self.inner.get_base(key).await
            }
            async fn put_base(&self, inventory: &Inventory) -> StoreResult<()> {
                self.inner.put_base(inventory).await
            }
            async fn delete_base(&self, key: &InventoryKey) -> StoreResult<bool> {
                self.inner.delete_base(key).await
            }
            async fn append_journal(&self, entry: &NewJournalEntry) -> StoreResult<i64> {
                if self.journal_down.load(Ordering::SeqCst) {
                    return Err(StoreError::Connection("journal unavailable".to_string()));
                }
                self.inner.append_journal(entry).await
            }
            async fn live_journal_ids(&self, key: &InventoryKey) -> StoreResult<Vec<i64>> {
                self.inner.live_journal_ids(key).await
            }
            async fn sum_journal(&self, ids: &[i64]) -> StoreResult<Option<RollupResult>> {
                self.inner.sum_journal(ids).await
            }
            async fn delete_journal(&self, ids: &[i64]) -> StoreResult<u64> {
                self.inner.delete_journal(ids).await
            }
            async fn delete_journal_by_key(&self, key: &InventoryKey) -> StoreResult<u64> {
                self.inner.delete_journal_by_key(key).await
            }
            async fn keys_needing_rollup(&self, min_rows: usize) -> StoreResult<Vec<InventoryKey>> {
                self.inner.keys_needing_rollup(min_rows).await
            }
            async fn get_lock(&self, key: &InventoryKey) -> StoreResult<Option<JournalLock>> {
                self.inner.get_lock(key).await
            }
            async fn create_lock(&self, key: &InventoryKey) -> StoreResult<JournalLock> {
                self.inner.create_lock(key).await
            }
            async fn cas_lock(&self, key: &InventoryKey, expected: i64, new: i64) -> StoreResult<bool> {
                self.inner.cas_lock(key, expected, new).await
            }
            async fn delete_lock(&self, key: &InventoryKey) -> StoreResult<bool> {
                self.inner.delete_lock(key).await
            }
            async fn commit(&self, work: UnitOfWork) -> StoreResult<()> {
                self.inner.commit(work).await
            }
            async fn inventory_with_rollup(&self, key: &InventoryKey) -> StoreResult<Option<RolledUpInventory>> {
                self.inner.inventory_with_rollup(key).await
            }
            async fn inventories_with_rollups_in_warehouse(
                &self,
                sku_codes: &[String],
                warehouse_id: i64,
            ) -> StoreResult<Vec<RolledUpInventory>> {
                self.inner.inventories_with_rollups_in_warehouse(sku_codes, warehouse_id).await
            }
            async fn inventories_with_rollups_for_sku(&self, sku_code: &str) -> StoreResult<Vec<RolledUpInventory>> {
                self.inner.inventories_with_rollups_for_sku(sku_code).await
            }
            async fn low_stock_base(&self, sku_codes: &[String], warehouse_id: i64) -> StoreResult<Vec<RolledUpInventory>> {
                self.inner.low_stock_base(sku_codes, warehouse_id).await
            }
            async fn low_stock_journaled(
                &self,
                sku_codes: &[String],
                warehouse_id: i64,
            ) -> StoreResult<Vec<RolledUpInventory>> {
                self.inner.low_stock_journaled(sku_codes, warehouse_id).await
            }
            async fn processed_command(&self, idempotency_key: &str) -> StoreResult<Option<ProcessedCommand>> {
                self.inner.processed_command(idempotency_key).await
            }
            async fn record_processed_command(&self, record: &ProcessedCommand) -> StoreResult<()> {
                self.inner.record_processed_command(record).await
            }
        }
    }

    #[tokio::test]
    async fn storage_failure_replies_failed_and_allows_resend() {
        let store = Arc::new(flaky::FlakyJournalStore::default());
        let dispatcher = CommandDispatcher::new(store.clone(), Capabilities::default());
        let processor = CommandProcessor::new(store.clone(), dispatcher);
        let key = InventoryKey::new("SKU-1", 1);
        let envelope = CommandEnvelope::new(InventoryCommand::Adjust { key: key.clone(), quantity: 4 });

        store.set_journal_down(true);
        let reply = processor.process(&envelope).await.unwrap();
        assert_eq!(reply.status, CommandStatus::Failed);
        assert!(reply.error.unwrap().contains("journal unavailable"));
        assert!(store.processed_command(&envelope.idempotency_key).await.unwrap().is_none());
        assert!(store.inner.journal_entries(&key).await.is_empty());

        store.set_journal_down(false);
        let retried = processor.process(&envelope).await.unwrap();
        assert_eq!(retried.status, CommandStatus::Success);
        assert_eq!(store.inner.journal_entries(&key).await.len(), 1);
    }
}
