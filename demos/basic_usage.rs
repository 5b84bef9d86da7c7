//! Wrap a simulated LLM call with the response cache.
//!
//! Run with `cargo run --example basic_usage`. Set `AI_CACHE_STORAGE=networked`
//! and `AI_CACHE_REDIS_URL=redis://127.0.0.1:6379` to use Redis instead.

use ai_response_cache::telemetry;
use ai_response_cache::{CacheConfig, CacheEngine, CallDescriptor, CallOutput};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Completion {
    text: String,
    total_tokens: u64,
}

async fn fake_completion(prompt: &str) -> ai_response_cache::Result<CallOutput<Completion>> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    let completion = Completion {
        text: format!("echo: {prompt}"),
        total_tokens: 128,
    };
    let tokens = completion.total_tokens;
    Ok(CallOutput::new(completion).with_usage(tokens, 0.0042))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CacheConfig::from_env()?.with_debug(true);
    telemetry::init_tracing(config.debug);

    let engine = CacheEngine::new(config)?;
    println!(
        "backend: {} (ttl {}s)",
        engine.backend_name(),
        engine.config().ttl
    );

    let prompt = "What is ownership in Rust?";
    let descriptor = || {
        CallDescriptor::new("openai", "gpt-4")
            .with_prompt(json!([{"role": "user", "content": prompt}]))
            .with_params(json!({"temperature": 0.2}))
    };

    for round in 1..=2 {
        let started = std::time::Instant::now();
        let completion: Completion = engine
            .wrap(|| fake_completion(prompt), descriptor())
            .await?;
        println!(
            "round {round}: {:?} in {:?}",
            completion.text,
            started.elapsed()
        );
    }

    let stats = engine.stats();
    println!(
        "requests={} hits={} hit_rate={:.1}% saved=${:.4}",
        stats.total_requests, stats.cache_hits, stats.hit_rate, stats.total_cost_saved
    );

    let removed = engine.delete_by_pattern("*openai*").await?;
    println!("invalidated {removed} openai entries");

    engine.disconnect().await;
    Ok(())
}
