//! Example: session persistence through the inference pool.
//!
//! Creates a two-slot pool, generates on one session, forces it to disk and
//! reloads it to continue where it left off.
//!
//! Run with:
//!   cargo run --example persist -- --model model.gguf

use anyhow::Result;
use crucible_candle::CandleBackend;
use crucible_core::{dispatch, InferencePool, SessionParams};
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let model = args
        .iter()
        .position(|a| a == "--model")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("model.gguf");

    dispatch::global().write().register(Arc::new(CandleBackend::fallback()));

    let params = SessionParams {
        seed: 42,
        ..Default::default()
    };
    let mut pool = InferencePool::new(2, "persist-demo", true)?;

    let session = pool.create(1, model.as_ref(), params.clone())?;
    session.append_text("Once upon a time")?;
    let first = session.run("", |_| true, {
        let mut budget = 24usize;
        move |_| {
            budget -= 1;
            budget > 0
        }
    })?;
    println!("first burst: {first}");

    pool.store_all()?;
    println!("resident ids: {:?}", pool.active_ids());

    // Occupy both slots so session 1 gets evicted, then pull it back in
    pool.create(2, model.as_ref(), params.clone())?;
    pool.create(3, model.as_ref(), params)?;
    println!("resident ids after churn: {:?}", pool.active_ids());

    let restored = pool.get(1)?;
    let second = restored.run("", |_| true, {
        let mut budget = 24usize;
        move |_| {
            budget -= 1;
            budget > 0
        }
    })?;
    println!("continued: {second}");

    pool.delete(2);
    pool.delete(3);
    pool.delete(1);
    Ok(())
}
