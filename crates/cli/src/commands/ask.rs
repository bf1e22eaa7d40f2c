//! `fastrag ask` and `fastrag history` — One turn from the command line.

use fastrag_config::AppConfig;
use fastrag_core::message::{ConversationId, OwnerId};
use fastrag_gateway::{Services, open_stores};
use fastrag_rag::{TurnOptions, TurnOverrides, TurnResponse};
use std::time::Duration;
use tracing::debug;

/// Per-turn settings for `ask`; anything omitted comes from the config.
#[derive(Debug, Default, clap::Args)]
pub struct TurnFlags {
    /// Answer with another provider (claude, openai, gemini, ollama)
    #[arg(long)]
    pub provider: Option<String>,

    /// Answer with another model
    #[arg(long)]
    pub model: Option<String>,

    /// Sampling temperature (0.0 to 2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Cap on answer tokens
    #[arg(long)]
    pub max_tokens: Option<usize>,

    /// Answer without searching notes
    #[arg(long)]
    pub no_rag: bool,
}

impl TurnFlags {
    pub fn overrides(&self) -> TurnOverrides {
        TurnOverrides {
            llm_provider: self.provider.clone(),
            llm_model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            rag_enabled: self.no_rag.then_some(false),
        }
    }
}

pub async fn run(
    conversation: Option<String>,
    owner: &str,
    message: &str,
    flags: &TurnFlags,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let services = Services::from_config(&config).await?;

    let conversation_id = conversation
        .as_deref()
        .map(ConversationId::from)
        .unwrap_or_default();
    let mut options = TurnOptions::default().with_overrides(flags.overrides());
    if let Some(secs) = config.gateway.turn_timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    debug!(conversation = %conversation_id, owner, "Running turn");
    let result = services
        .orchestrator
        .handle_turn_with(&conversation_id, &OwnerId::from(owner), message, options)
        .await;

    if json {
        let mut value = serde_json::to_value(TurnResponse::from(&result))?;
        value["conversation_id"] = serde_json::Value::String(conversation_id.to_string());
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if !result.answer_text.is_empty() {
            println!("{}", result.answer_text);
        }
        if !result.context_used.is_empty() {
            eprintln!();
            eprintln!("   Context ({} chunks):", result.context_used.len());
            for chunk in &result.context_used {
                eprintln!(
                    "   [{:.2}] {}: {}",
                    chunk.relevance_score,
                    chunk.source.as_str(),
                    preview(&chunk.text, 60)
                );
            }
        }
        eprintln!("   Conversation: {conversation_id}");
    }

    match result.error {
        // The answer was produced; losing the record is reported, not fatal.
        Some(e @ fastrag_rag::TurnError::PersistenceFailed(_)) => {
            eprintln!("   Warning: {e}");
            Ok(())
        }
        Some(e) => Err(format!("{}: {e}", e.kind()).into()),
        None => Ok(()),
    }
}

pub async fn history(conversation: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let (history, _) = open_stores(&config).await?;

    let turns = history.get_history(&ConversationId::from(conversation)).await?;
    if turns.is_empty() {
        println!("No turns in conversation {conversation}.");
        return Ok(());
    }

    for turn in &turns {
        println!(
            "[{}] {:>9}: {}",
            turn.created_at.format("%Y-%m-%d %H:%M:%S"),
            turn.role.as_str(),
            turn.text
        );
    }
    Ok(())
}

/// First `max` characters of `text` on one line.
fn preview(text: &str, max: usize) -> String {
    let line: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= max {
        line
    } else {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(clap::Parser)]
    struct AskArgs {
        #[command(flatten)]
        flags: TurnFlags,
    }

    fn parse(args: &[&str]) -> TurnFlags {
        use clap::Parser;
        AskArgs::parse_from(std::iter::once("ask").chain(args.iter().copied())).flags
    }

    #[test]
    fn flags_become_turn_overrides() {
        let overrides = parse(&[
            "--provider",
            "gemini",
            "--model",
            "gemini-1.5-pro",
            "--temperature",
            "0.2",
            "--max-tokens",
            "300",
            "--no-rag",
        ])
        .overrides();
        assert_eq!(overrides.llm_provider.as_deref(), Some("gemini"));
        assert_eq!(overrides.llm_model.as_deref(), Some("gemini-1.5-pro"));
        assert_eq!(overrides.temperature, Some(0.2));
        assert_eq!(overrides.max_tokens, Some(300));
        assert_eq!(overrides.rag_enabled, Some(false));
    }

    #[test]
    fn no_flags_change_nothing() {
        assert_eq!(parse(&[]).overrides(), TurnOverrides::default());
    }

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        assert_eq!(preview("Paris\n  is   the capital", 60), "Paris is the capital");
        assert_eq!(preview("abcdef", 3), "abc…");
        assert_eq!(preview("日本語です", 2), "日本…");
    }
}
