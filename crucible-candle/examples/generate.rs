//! Example: streaming generation from a local GGUF model.
//!
//! Expects a `tokenizer.json` next to the model file.
//!
//! Run with:
//!   cargo run --example generate -- --model model.gguf --prompt "Hello"
//!   cargo run --example generate -- --model model.gguf --end "\n"

use anyhow::Result;
use crucible_candle::CandleBackend;
use crucible_core::{dispatch, Session, SessionParams};
use std::io::Write;
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let arg = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    };
    let model = arg("--model").unwrap_or("model.gguf");
    let prompt = arg("--prompt").unwrap_or("The best programming language is");
    let end = arg("--end").unwrap_or("");
    let seed: u32 = arg("--seed").and_then(|s| s.parse().ok()).unwrap_or(0);

    dispatch::global().write().register(Arc::new(CandleBackend::fallback()));

    println!("Crucible - inference facade");
    println!("Model: {model}");
    println!("Prompt: {prompt}");
    println!();

    let params = SessionParams {
        seed,
        ..Default::default()
    };
    let mut session = Session::open(model, params)?;
    println!(
        "Loaded. mem/token ~{} KiB, context {} tokens",
        session.mem_per_token() / 1024,
        session.params().n_ctx
    );

    session.append(prompt, |progress| {
        print!("\rIngesting prompt: {progress:.0}%");
        let _ = std::io::stdout().flush();
        true
    })?;
    println!();

    print!("{prompt}");
    let generated = session.run(
        end,
        |_| true,
        |piece| {
            print!("{piece}");
            let _ = std::io::stdout().flush();
            true
        },
    )?;
    println!();
    println!();
    println!(
        "Generated {} bytes, context now {} tokens",
        generated.len(),
        session.context_size()
    );

    Ok(())
}
