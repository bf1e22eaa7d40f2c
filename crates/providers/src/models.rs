//! Known models and their context windows.

/// Models offered for each provider.
pub fn supported_models(provider: &str) -> &'static [&'static str] {
    match provider {
        "claude" | "anthropic" => &[
            "claude-3-5-sonnet-20240620",
            "claude-3-opus-20240229",
            "claude-3-haiku-20240307",
        ],
        "openai" => &["gpt-4o", "gpt-4o-mini", "gpt-3.5-turbo"],
        "gemini" | "google" => &["gemini-1.5-flash", "gemini-1.5-pro"],
        _ => &[],
    }
}

/// Total context window (input + output tokens) for a known model.
///
/// Matches on prefixes so dated snapshots (`gpt-4o-2024-08-06`) and
/// router-qualified names (`anthropic/claude-3.5-sonnet`) resolve too.
pub fn context_window(model: &str) -> Option<usize> {
    let model = model.rsplit('/').next().unwrap_or(model);
    let table: &[(&str, usize)] = &[
        ("claude-", 200_000),
        ("gpt-4o", 128_000),
        ("gpt-4-turbo", 128_000),
        ("gpt-3.5-turbo", 16_385),
        ("gemini-1.5-pro", 2_097_152),
        ("gemini-1.5-flash", 1_048_576),
        ("gemini-2", 1_048_576),
    ];
    table
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, window)| *window)
}
