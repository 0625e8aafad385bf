//! Simple Producer Example
//!
//! This example sends records through a producer into the in-memory stream,
//! with the stream throttling a share of first attempts so the retry path
//! shows up in the logs.
//!
//! Run with:
//! ```bash
//! RUST_LOG=streamfeed_client=debug cargo run --package streamfeed-client --example simple_producer
//! ```
//!
//! Producer settings can be overridden with `STREAMFEED_*` variables, e.g.
//! `STREAMFEED_MAX_BATCH_COUNT=5`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use streamfeed_client::{
    BatchResult, FailureReason, MemoryStream, Producer, ProducerConfig, Record,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("\n🎯 streamfeed Producer Example");
    println!("================================\n");

    // Step 1: Setup stream
    println!("📊 Step 1: Setting up in-memory stream");
    let stream = MemoryStream::new();
    stream.set_rule(|record, attempt| {
        // throttle every third user on the first try
        (attempt == 1 && record.partition_key().ends_with('2')).then(|| {
            FailureReason::from_error_code(
                "ProvisionedThroughputExceededException",
                "Rate exceeded for shard shardId-000000000000",
            )
        })
    });
    println!("   ✅ Stream ready\n");

    // Step 2: Create producer
    println!("🚀 Step 2: Creating producer");
    let config = ProducerConfig::from_env()?;
    let batches = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&batches);
    let producer = Producer::start_with_listener(config, stream.clone(), move |r: &BatchResult| {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            batch_id = r.batch_id,
            kind = ?r.attempt_kind,
            succeeded = r.succeeded.len(),
            failed = r.failed.len(),
            "batch complete"
        );
    })?;
    println!("   ✅ Producer started\n");

    // Step 3: Send records
    println!("✍️  Step 3: Sending records\n");
    let mut handles = Vec::new();
    for i in 0..10 {
        let user_id = format!("user{}", i % 3);
        let order_data = format!("{{\"order_id\": {}, \"amount\": {}}}", i, i * 100);
        handles.push(producer.enqueue(Record::new(user_id, order_data)).await?);
    }

    for handle in handles {
        match handle.await {
            Ok(delivery) => println!(
                "   ✅ record {} → {} seq {} ({} attempt(s))",
                delivery.correlation_id,
                delivery.metadata.shard_id,
                delivery.metadata.sequence_number,
                delivery.attempts
            ),
            Err(e) => println!("   ❌ {}", e),
        }
    }

    // Step 4: Shut down
    println!("\n🛑 Step 4: Closing producer");
    producer.close().await?;
    let stats = producer.stats();
    println!("   ✅ Closed after {} batches", batches.load(Ordering::Relaxed));
    println!("   📈 Stats: {}", serde_json::to_string(&stats)?);

    Ok(())
}
